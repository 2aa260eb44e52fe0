//! Infrastructure event bus implementations and backend selection.
//!
//! The bus abstraction and the process-local backends live in
//! `pulse-events`. This module adds the Redis Streams backend and
//! [`build_bus`], which picks a backend from configuration.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBus;

use std::sync::Arc;

use pulse_events::{BusError, BusResult, EventBus, InMemoryBus, LogBus};
use tracing::info;

use crate::config::{BusBackend, PulseConfig};

/// Build the configured bus. The caller owns its lifecycle (`start`/`close`).
pub fn build_bus(config: &PulseConfig) -> BusResult<Arc<dyn EventBus>> {
    info!(backend = %config.bus_backend, "building event bus");
    match config.bus_backend {
        BusBackend::Memory => Ok(Arc::new(InMemoryBus::new(config.delivery.clone()))),
        BusBackend::Log => Ok(Arc::new(LogBus::new())),
        BusBackend::Redis => build_redis(config),
    }
}

#[cfg(feature = "redis")]
fn build_redis(config: &PulseConfig) -> BusResult<Arc<dyn EventBus>> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| BusError::Startup("PULSE_REDIS_URL is not set".into()))?;
    let bus = RedisStreamsBus::new(url, config.stream_prefix.clone(), config.delivery.clone())?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
fn build_redis(_config: &PulseConfig) -> BusResult<Arc<dyn EventBus>> {
    Err(BusError::Startup(
        "redis backend requested but pulse-infra was built without the `redis` feature".into(),
    ))
}
