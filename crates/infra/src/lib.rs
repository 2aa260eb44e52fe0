//! Infrastructure layer: idempotency ledger, broker-backed buses, config.

pub mod config;
pub mod consumer;
pub mod event_bus;
pub mod idempotency;


pub use config::{BusBackend, ConfigError, PulseConfig};
pub use consumer::{IdempotentConsumer, idempotent};
pub use event_bus::build_bus;
pub use idempotency::{
    IdempotencyLedger, InMemoryLedger, LedgerEntry, PostgresLedger, consume_once,
};
