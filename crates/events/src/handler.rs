use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use pulse_core::AppError;

use crate::EventEnvelope;

/// One delivery of an envelope to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub envelope: Arc<EventEnvelope<JsonValue>>,
    /// 1-based delivery attempt for this consumer.
    pub attempt: u32,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, envelope: Arc<EventEnvelope<JsonValue>>) -> Self {
        Self {
            topic: topic.into(),
            envelope,
            attempt: 1,
        }
    }

    pub fn envelope(&self) -> &EventEnvelope<JsonValue> {
        &self.envelope
    }

    pub(crate) fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Why a handler did not acknowledge a delivery.
///
/// Returning any `AppError` with `?` yields [`HandlerError::Transient`]:
/// the bus redelivers. Use [`HandlerError::Terminal`] for payloads that can
/// never succeed (they go straight to the dead-letter path).
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(#[source] AppError),

    #[error("terminal: {0}")]
    Terminal(#[source] AppError),
}

impl HandlerError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::Terminal(_))
    }

    pub fn app_error(&self) -> &AppError {
        match self {
            HandlerError::Transient(e) | HandlerError::Terminal(e) => e,
        }
    }
}

impl From<AppError> for HandlerError {
    fn from(err: AppError) -> Self {
        HandlerError::Transient(err)
    }
}

/// A named consumer of envelopes.
///
/// The name identifies the consumer in the idempotency ledger, in consumer
/// groups and in logs; it must be stable across restarts.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (**self).handle(delivery).await
    }
}

impl fmt::Debug for dyn EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHandler({})", self.name())
    }
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Adapt an async closure into an [`EventHandler`].
///
/// ```ignore
/// let h = handler_fn("mailer", |d: Delivery| async move {
///     send_welcome(d.envelope.payload()).await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery.clone()).await
    }
}
