//! Idempotency ledger: the durable record of which consumer has processed
//! which event.
//!
//! Buses deliver at least once; exactly-once *processing* comes from every
//! consumer claiming `(consumer, idempotency_key)` here before its side
//! effect. The claim is an atomic insert, so of any number of concurrent
//! claims for the same pair exactly one succeeds.
//!
//! ## Known limitation
//!
//! The claim and the consumer's side effect are not one transaction. If the
//! process dies after the claim but before the side effect, redelivery is
//! suppressed and the effect is lost unless it is re-driven out of band.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use pulse_core::{AppError, AppResult, TenantId};

/// One claim. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub consumer: String,
    pub idempotency_key: String,
    pub tenant_id: Option<TenantId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        consumer: impl Into<String>,
        idempotency_key: impl Into<String>,
        tenant_id: Option<TenantId>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            idempotency_key: idempotency_key.into(),
            tenant_id,
            created_at: Utc::now(),
        }
    }
}

/// Storage behind [`consume_once`].
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Atomically insert `entry`.
    ///
    /// Fails with `duplicate_event` if `(consumer, idempotency_key)` already
    /// exists, and with `ledger_unavailable` when storage cannot be reached.
    async fn insert(&self, entry: &LedgerEntry) -> AppResult<()>;

    /// Whether `(consumer, idempotency_key)` has been claimed.
    async fn contains(&self, consumer: &str, idempotency_key: &str) -> AppResult<bool>;

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Claim `key` for `consumer`.
///
/// - empty key: `missing_idempotency_key` (400), storage is not touched
/// - first claim: `Ok(())`
/// - any later claim: `duplicate_event` (409)
/// - storage failure: propagated unchanged (`ledger_unavailable`)
#[instrument(
    skip(ledger, tenant_id),
    fields(backend = ledger.backend(), tenant_id = tenant_id.map(|t| t.as_str())),
    err(level = "debug")
)]
pub async fn consume_once(
    ledger: &dyn IdempotencyLedger,
    consumer: &str,
    key: &str,
    tenant_id: Option<&TenantId>,
) -> AppResult<()> {
    if key.is_empty() {
        return Err(AppError::missing_idempotency_key());
    }
    if consumer.trim().is_empty() {
        return Err(AppError::invalid_event("consumer name must not be empty"));
    }

    ledger
        .insert(&LedgerEntry::new(consumer, key, tenant_id.cloned()))
        .await?;
    debug!("claimed");
    Ok(())
}
