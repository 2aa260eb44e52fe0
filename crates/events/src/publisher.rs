//! Validating publisher: the only path producers should use to emit events.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::instrument;

use pulse_core::{AppError, AppResult, ErrorCode};

use crate::{EventBus, EventEnvelope, SchemaRegistry};

/// Validates envelopes against the registry before handing them to the bus.
///
/// The topic is the envelope's `type`. Nothing reaches the bus unless the
/// metadata and payload validate.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    registry: Arc<SchemaRegistry>,
    publish_timeout: Option<Duration>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            bus,
            registry,
            publish_timeout: None,
        }
    }

    /// Fail publishes that take longer than `timeout` with `publish_timeout`.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    #[instrument(
        skip(self, envelope),
        fields(
            topic = envelope.event_type(),
            event_id = %envelope.id(),
            tenant_id = %envelope.tenant_id(),
        ),
        err
    )]
    pub async fn publish<T>(&self, envelope: &EventEnvelope<T>) -> AppResult<()>
    where
        T: Serialize + Clone,
    {
        let envelope = envelope.clone().into_json()?;
        self.registry.validate_envelope(&envelope)?;

        let topic = envelope.event_type();
        let publish = self.bus.publish(topic, &envelope);
        match self.publish_timeout {
            None => publish.await.map_err(AppError::from),
            Some(deadline) => match tokio::time::timeout(deadline, publish).await {
                Ok(result) => result.map_err(AppError::from),
                Err(_) => Err(AppError::new(
                    ErrorCode::PublishTimeout,
                    format!("publish to {topic} did not complete within {deadline:?}"),
                )),
            },
        }
    }
}
