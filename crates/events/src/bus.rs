//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus moves envelopes from producers to the consumers registered for a
//! topic. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory logs, Redis Streams, a logging stub.
//! - **At-least-once delivery**: a consumer may see the same envelope more
//!   than once; deduplication belongs to the idempotency ledger.
//! - **Per-topic order per consumer**: each (topic, consumer) pair is served
//!   by one sequential worker.
//!
//! Backends are selected by the composing service and injected as
//! `Arc<dyn EventBus>`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use pulse_core::{AppError, ErrorCode};

use crate::{EventEnvelope, EventHandler};

/// Errors surfaced by bus backends.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The backend could not be started (unreachable broker, bad URL, ...).
    #[error("bus failed to start: {0}")]
    Startup(String),

    /// The bus was closed; no further publishes are accepted.
    #[error("bus is closed")]
    Closed,

    /// The backend refused or failed to store the message.
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// A consumer could not be attached.
    #[error("registering {consumer} on {topic} failed: {reason}")]
    Register {
        topic: String,
        consumer: String,
        reason: String,
    },

    #[error("envelope could not be encoded: {0}")]
    Serialization(String),
}

pub type BusResult<T> = Result<T, BusError>;

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        let message = err.to_string();
        AppError::new(ErrorCode::BusUnavailable, message).with_cause(err)
    }
}

/// Point-in-time health report. Producing one never fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusHealth {
    pub healthy: bool,
    /// Backend name (`memory`, `log`, `redis`).
    pub backend: &'static str,
    pub detail: Option<String>,
}

impl BusHealth {
    pub fn healthy(backend: &'static str) -> Self {
        Self {
            healthy: true,
            backend,
            detail: None,
        }
    }

    pub fn unhealthy(backend: &'static str, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            backend,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Pluggable message bus.
///
/// ## Lifecycle
///
/// `start` → any number of `publish` / `register_consumer` → `close`.
/// `start` is idempotent. `close` is safe before `start` and idempotent;
/// after it, `publish` returns [`BusError::Closed`].
///
/// ## Delivery
///
/// A successful `publish` means the envelope is stored for at-least-once
/// delivery to every consumer of the topic, current and future. A failed
/// `publish` means nothing was stored; retrying with the same envelope is
/// safe because consumers deduplicate on the idempotency key.
///
/// `register_consumer` attaches a handler and returns once the delivery loop
/// is scheduled. Handlers are never invoked inline. Transient failures are
/// redelivered according to the backend's [`DeliveryPolicy`](crate::DeliveryPolicy);
/// exhausted or terminal deliveries go to the dead-letter path.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn start(&self) -> BusResult<()>;

    async fn publish(&self, topic: &str, envelope: &EventEnvelope<JsonValue>) -> BusResult<()>;

    async fn register_consumer(&self, topic: &str, handler: Arc<dyn EventHandler>)
    -> BusResult<()>;

    async fn health(&self) -> BusHealth;

    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventBus")
    }
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn start(&self) -> BusResult<()> {
        (**self).start().await
    }

    async fn publish(&self, topic: &str, envelope: &EventEnvelope<JsonValue>) -> BusResult<()> {
        (**self).publish(topic, envelope).await
    }

    async fn register_consumer(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        (**self).register_consumer(topic, handler).await
    }

    async fn health(&self) -> BusHealth {
        (**self).health().await
    }

    async fn close(&self) -> BusResult<()> {
        (**self).close().await
    }
}
