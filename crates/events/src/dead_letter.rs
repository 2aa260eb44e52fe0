//! Dead-letter records for deliveries that will not be retried.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::error;

use crate::EventEnvelope;

/// Terminal record of a delivery that exhausted its budget or failed
/// terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub topic: String,
    pub envelope: EventEnvelope<JsonValue>,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        consumer: impl Into<String>,
        topic: impl Into<String>,
        envelope: EventEnvelope<JsonValue>,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            topic: topic.into(),
            envelope,
            attempts,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// In-process dead-letter list.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, letter: DeadLetter) {
        error!(
            consumer = %letter.consumer,
            topic = %letter.topic,
            event_id = %letter.envelope.id(),
            tenant_id = %letter.envelope.tenant_id(),
            attempts = letter.attempts,
            reason = %letter.reason,
            "event dead-lettered"
        );
        self.lock().push(letter);
    }

    /// Snapshot of every dead letter, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.lock().clone()
    }

    /// Dead letters recorded for one consumer.
    pub fn for_consumer(&self, consumer: &str) -> Vec<DeadLetter> {
        self.lock()
            .iter()
            .filter(|l| l.consumer == consumer)
            .cloned()
            .collect()
    }

    /// Remove and return everything (manual replay).
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetter>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::TenantId;
    use serde_json::json;

    fn letter(consumer: &str) -> DeadLetter {
        let envelope = EventEnvelope::new(
            "employee.created",
            1,
            "directory",
            TenantId::parse("t1").unwrap(),
            json!({}),
        );
        DeadLetter::new(consumer, "employee.created", envelope, 5, "ledger down")
    }

    #[test]
    fn records_and_filters_by_consumer() {
        let dlq = DeadLetterQueue::new();
        dlq.push(letter("mailer"));
        dlq.push(letter("payroll"));
        dlq.push(letter("mailer"));

        assert_eq!(dlq.len(), 3);
        assert_eq!(dlq.for_consumer("mailer").len(), 2);
        assert_eq!(dlq.drain().len(), 3);
        assert!(dlq.is_empty());
    }

    #[test]
    fn serializes_with_the_envelope_inline() {
        let json = serde_json::to_value(letter("mailer")).unwrap();
        assert_eq!(json["consumer"], "mailer");
        assert_eq!(json["envelope"]["type"], "employee.created");
        assert_eq!(json["attempts"], 5);
    }
}
