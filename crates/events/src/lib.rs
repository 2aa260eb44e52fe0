//! Event envelope, schema validation and bus mechanics.
//!
//! No storage here: the idempotency ledger and broker-backed buses live in
//! `pulse-infra`.

pub mod bus;
pub mod dead_letter;
pub mod envelope;
pub mod handler;
pub mod in_memory_bus;
pub mod log_bus;
pub mod publisher;
pub mod retry;
pub mod runner;
pub mod schema;

pub use bus::{BusError, BusHealth, BusResult, EventBus};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use envelope::EventEnvelope;
pub use handler::{Delivery, EventHandler, FnHandler, HandlerError, handler_fn};
pub use in_memory_bus::InMemoryBus;
pub use log_bus::LogBus;
pub use publisher::EventPublisher;
pub use retry::{
    BackoffStrategy, DeliveryOutcome, DeliveryPolicy, RetryPolicy, attempt_once, deliver,
};
pub use runner::{
    ConsumerRunner, ConsumerStats, ConsumerStatsSnapshot, DeliverySource, shutdown_signalled,
};
pub use schema::{
    CompiledSchema, SchemaKey, SchemaRegistry, SchemaViolation, SchemaViolations, Validator,
    compile_schema, create_validator,
};
