use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pulse_core::{AppError, AppResult, EventId, TenantId};

/// Envelope for an event: identity, routing and causality metadata around a
/// topic-specific payload.
///
/// This is the unit every producer publishes and every consumer receives.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - **Immutable once published**: fields are private; the `with_*`
///   builders consume the envelope and are meant for the producer side.
/// - `type` doubles as the topic name; schema evolution goes through
///   `version`, never through a new topic name.
///
/// Wire shape: `{ id, type, version, source, timestamp, tenant_id,
/// correlation_id?, causation_id?, idempotency_key?, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    id: EventId,

    #[serde(rename = "type")]
    event_type: String,

    version: u32,

    /// Producing service name.
    source: String,

    /// Event creation time (RFC 3339).
    timestamp: DateTime<Utc>,

    tenant_id: TenantId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,

    payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create an envelope with a fresh id and the current time.
    pub fn new(
        event_type: impl Into<String>,
        version: u32,
        source: impl Into<String>,
        tenant_id: TenantId,
        payload: T,
    ) -> Self {
        Self::with_id(EventId::new(), event_type, version, source, tenant_id, payload)
    }

    /// Create an envelope with an explicit id (redelivery simulation, tests).
    pub fn with_id(
        id: EventId,
        event_type: impl Into<String>,
        version: u32,
        source: impl Into<String>,
        tenant_id: TenantId,
        payload: T,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            version,
            source: source.into(),
            timestamp: Utc::now(),
            tenant_id,
            correlation_id: None,
            causation_id: None,
            idempotency_key: None,
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Derive a follow-up envelope: same tenant and correlation, `causation_id`
    /// pointing at this event.
    pub fn caused<U>(
        &self,
        event_type: impl Into<String>,
        version: u32,
        source: impl Into<String>,
        payload: U,
    ) -> EventEnvelope<U> {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        EventEnvelope::new(event_type, version, source, self.tenant_id.clone(), payload)
            .with_correlation_id(correlation)
            .with_causation_id(self.id.to_string())
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// The key consumers claim in the idempotency ledger: the producer's
    /// `idempotency_key` when present, otherwise the event `id`.
    pub fn effective_idempotency_key(&self) -> &str {
        match self.idempotency_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => self.id.as_str(),
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Check the metadata invariants that serde alone does not enforce.
    pub fn validate_metadata(&self) -> AppResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(AppError::invalid_event("type must not be empty"));
        }
        if self.version == 0 {
            return Err(AppError::invalid_event("version must be >= 1"));
        }
        if self.source.trim().is_empty() {
            return Err(AppError::invalid_event("source must not be empty"));
        }
        Ok(())
    }

    fn map_payload<U>(self, payload: U) -> EventEnvelope<U> {
        EventEnvelope {
            id: self.id,
            event_type: self.event_type,
            version: self.version,
            source: self.source,
            timestamp: self.timestamp,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            idempotency_key: self.idempotency_key,
            payload,
        }
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Erase the payload type for transport.
    pub fn into_json(self) -> AppResult<EventEnvelope<JsonValue>> {
        let payload = serde_json::to_value(&self.payload).map_err(|e| {
            AppError::invalid_event(format!("payload is not serializable: {e}")).with_cause(e)
        })?;
        Ok(self.map_payload(payload))
    }
}

impl EventEnvelope<JsonValue> {
    /// Decode the payload into a typed event.
    pub fn decode<T>(&self) -> AppResult<EventEnvelope<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let payload = T::deserialize(&self.payload).map_err(|e| {
            AppError::invalid_event(format!("payload does not match {}: {e}", self.event_type))
                .with_cause(e)
        })?;
        Ok(self.clone().map_payload(payload))
    }
}
