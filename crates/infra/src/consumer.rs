//! Idempotent consumer wrapper.
//!
//! Every handler that performs a side effect should be registered through
//! [`IdempotentConsumer`]. It claims the delivery in the ledger under the
//! handler's own name before running the handler:
//!
//! - claim succeeded: run the inner handler
//! - `duplicate_event`: acknowledge without running it
//! - any other claim failure: transient, the bus redelivers
//!
//! Deduplication is per consumer: two consumers of the same topic each
//! process every event once.
//!
//! ## Known limitation
//!
//! The claim and the side effect are not one transaction. Once the claim
//! is committed a redelivery would only be acknowledged as a duplicate, so
//! an inner handler failure after the claim is terminal: the envelope goes
//! to the dead-letter path with the claim left in place, and reconciliation
//! re-drives it from there. The same applies when the inner handler is
//! cancelled by the bus's handler timeout; the redelivery that follows is
//! dead-lettered instead of acknowledged.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error};

use pulse_core::{AppError, ErrorCode};
use pulse_events::{Delivery, EventHandler, HandlerError};

use crate::idempotency::{IdempotencyLedger, consume_once};

pub struct IdempotentConsumer<H> {
    inner: H,
    ledger: Arc<dyn IdempotencyLedger>,
    /// Keys claimed by a run that was cancelled before the inner handler
    /// returned.
    abandoned: Arc<Mutex<HashSet<String>>>,
}

/// Records the key as abandoned unless the inner handler ran to completion.
struct ClaimGuard {
    key: Option<String>,
    abandoned: Arc<Mutex<HashSet<String>>>,
}

impl ClaimGuard {
    fn complete(mut self) {
        self.key = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key);
        }
    }
}

fn claimed_failure(consumer: &str, key: &str, reason: &AppError) -> HandlerError {
    HandlerError::Terminal(
        AppError::new(
            reason.code(),
            format!("{consumer} failed after claiming {key}: {}", reason.message()),
        )
        .with_cause(reason.clone()),
    )
}

impl<H> IdempotentConsumer<H>
where
    H: EventHandler,
{
    pub fn new(inner: H, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        Self {
            inner,
            ledger,
            abandoned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn take_abandoned(&self, key: &str) -> bool {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

/// Wrap `inner` and return it ready for `EventBus::register_consumer`.
pub fn idempotent<H>(inner: H, ledger: Arc<dyn IdempotencyLedger>) -> Arc<dyn EventHandler>
where
    H: EventHandler + 'static,
{
    Arc::new(IdempotentConsumer::new(inner, ledger))
}

#[async_trait]
impl<H> EventHandler for IdempotentConsumer<H>
where
    H: EventHandler,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let envelope = delivery.envelope();
        let key = envelope.effective_idempotency_key();
        let consumer = self.inner.name();

        match consume_once(
            self.ledger.as_ref(),
            consumer,
            key,
            Some(envelope.tenant_id()),
        )
        .await
        {
            Ok(()) => {
                let guard = ClaimGuard {
                    key: Some(key.to_string()),
                    abandoned: self.abandoned.clone(),
                };
                let result = self.inner.handle(delivery).await;
                guard.complete();
                result.map_err(|e| {
                    error!(
                        consumer,
                        event_id = %envelope.id(),
                        idempotency_key = key,
                        error = %e.app_error(),
                        "handler failed after claim"
                    );
                    claimed_failure(consumer, key, e.app_error())
                })
            }
            Err(e) if e.is(ErrorCode::DuplicateEvent) => {
                if self.take_abandoned(key) {
                    let reason = AppError::new(
                        ErrorCode::UnknownError,
                        "handler was cancelled before completing",
                    );
                    return Err(claimed_failure(consumer, key, &reason));
                }
                debug!(
                    consumer,
                    event_id = %envelope.id(),
                    idempotency_key = key,
                    "duplicate delivery acknowledged"
                );
                Ok(())
            }
            Err(e) => Err(HandlerError::Transient(e)),
        }
    }
}
