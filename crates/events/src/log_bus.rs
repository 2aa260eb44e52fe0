//! Logging-only bus.
//!
//! Records every call through `tracing` and does nothing else: no delivery,
//! no I/O, no persistence. Useful to run producers without a broker and as
//! the smallest reference implementation of [`EventBus`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{BusError, BusHealth, BusResult, EventBus, EventEnvelope, EventHandler};

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Default)]
pub struct LogBus {
    state: AtomicU8,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for LogBus {
    async fn start(&self) -> BusResult<()> {
        match self
            .state
            .compare_exchange(CREATED, STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                info!(backend = "log", "bus started");
                Ok(())
            }
            Err(STARTED) => Ok(()),
            Err(_) => Err(BusError::Closed),
        }
    }

    async fn publish(&self, topic: &str, envelope: &EventEnvelope<JsonValue>) -> BusResult<()> {
        if self.state.load(Ordering::Acquire) == CLOSED {
            return Err(BusError::Closed);
        }
        info!(
            backend = "log",
            topic,
            event_id = %envelope.id(),
            tenant_id = %envelope.tenant_id(),
            version = envelope.version(),
            "publish"
        );
        Ok(())
    }

    async fn register_consumer(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        info!(backend = "log", topic, consumer = handler.name(), "register consumer (no delivery)");
        Ok(())
    }

    async fn health(&self) -> BusHealth {
        match self.state.load(Ordering::Acquire) {
            CLOSED => BusHealth::unhealthy("log", "closed"),
            _ => BusHealth::healthy("log"),
        }
    }

    async fn close(&self) -> BusResult<()> {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            info!(backend = "log", "bus closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Delivery, HandlerError, handler_fn};
    use pulse_core::TenantId;
    use serde_json::json;

    #[tokio::test]
    async fn accepts_everything_until_closed() {
        let bus = LogBus::new();
        bus.close().await.unwrap();
        let bus = LogBus::new();
        bus.start().await.unwrap();
        bus.start().await.unwrap();

        let handler = handler_fn("noop", |_d: Delivery| async { Ok::<(), HandlerError>(()) });
        bus.register_consumer("employee.created", handler).await.unwrap();

        let envelope = EventEnvelope::new(
            "employee.created",
            1,
            "directory",
            TenantId::parse("t1").unwrap(),
            json!({}),
        );
        bus.publish("employee.created", &envelope).await.unwrap();
        assert!(bus.health().await.healthy);

        bus.close().await.unwrap();
        bus.close().await.unwrap();
        assert!(matches!(
            bus.publish("employee.created", &envelope).await,
            Err(BusError::Closed)
        ));
        assert!(!bus.health().await.healthy);
    }
}
