//! Application error model.
//!
//! Every failure that crosses a component boundary in the event core is an
//! [`AppError`]: a stable machine-readable [`ErrorCode`], a human-readable
//! message, an optional wrapped cause and an optional transport status.
//! Callers branch on `code()`, never on the message text.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the event core.
pub type AppResult<T> = Result<T, AppError>;

/// Shared, type-erased underlying error.
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Stable failure kinds.
///
/// The serialized (snake_case) names are part of the wire contract and must
/// not change once released.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Envelope metadata or payload failed validation.
    InvalidEvent,
    /// A consumer tried to claim an event without an idempotency key.
    MissingIdempotencyKey,
    /// The (consumer, idempotency key) pair was already claimed.
    DuplicateEvent,
    /// A schema document could not be compiled.
    InvalidSchema,
    /// No schema is registered for an event type/version.
    SchemaNotRegistered,
    /// A different schema document is already registered for the same type/version.
    SchemaConflict,
    /// The idempotency ledger could not be reached or rejected the write.
    LedgerUnavailable,
    /// The message bus rejected or could not accept an operation.
    BusUnavailable,
    /// A publish did not complete before its deadline.
    PublishTimeout,
    /// Fallback for anything unanticipated.
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidEvent => "invalid_event",
            ErrorCode::MissingIdempotencyKey => "missing_idempotency_key",
            ErrorCode::DuplicateEvent => "duplicate_event",
            ErrorCode::InvalidSchema => "invalid_schema",
            ErrorCode::SchemaNotRegistered => "schema_not_registered",
            ErrorCode::SchemaConflict => "schema_conflict",
            ErrorCode::LedgerUnavailable => "ledger_unavailable",
            ErrorCode::BusUnavailable => "bus_unavailable",
            ErrorCode::PublishTimeout => "publish_timeout",
            ErrorCode::UnknownError => "unknown_error",
        }
    }

    /// Transport status used when an error of this kind reaches an HTTP edge.
    pub fn default_status(self) -> u16 {
        match self {
            ErrorCode::InvalidEvent | ErrorCode::MissingIdempotencyKey => 400,
            ErrorCode::DuplicateEvent | ErrorCode::SchemaConflict => 409,
            ErrorCode::SchemaNotRegistered => 422,
            ErrorCode::LedgerUnavailable | ErrorCode::BusUnavailable => 503,
            ErrorCode::PublishTimeout => 504,
            ErrorCode::InvalidSchema | ErrorCode::UnknownError => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged application error.
///
/// Immutable once handed to a caller; the builder methods consume `self`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AppError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<ErrorCause>,
    status: Option<u16>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            status: None,
        }
    }

    /// Attach an underlying error.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attach an already shared cause.
    pub fn with_shared_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Set the transport-facing status (fluent, for the HTTP boundary).
    pub fn with_http(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Convert any error into an `AppError`.
    ///
    /// An `AppError` passes through unchanged. Anything else keeps its
    /// message, is wrapped as `cause`, and gets `fallback` as its code.
    pub fn normalize<E>(err: E, fallback: ErrorCode) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(app) = (&err as &dyn Any).downcast_ref::<AppError>() {
            return app.clone();
        }
        Self::new(fallback, err.to_string()).with_cause(err)
    }

    /// Convert a non-error value (a bare message, a panic payload rendered
    /// as text, ...) into an `AppError` with no structured cause.
    pub fn normalize_message(value: impl fmt::Display, fallback: ErrorCode) -> Self {
        Self::new(fallback, value.to_string())
    }

    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidEvent, message).with_http(400)
    }

    pub fn missing_idempotency_key() -> Self {
        Self::new(
            ErrorCode::MissingIdempotencyKey,
            "idempotency key must not be empty",
        )
        .with_http(400)
    }

    pub fn duplicate_event(consumer: &str, key: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateEvent,
            format!("event {key} already processed by {consumer}"),
        )
        .with_http(409)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Explicit status, if one was set. See [`AppError::status_or_default`].
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn status_or_default(&self) -> u16 {
        self.status.unwrap_or_else(|| self.code.default_status())
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn normalize_keeps_message_and_wraps_cause() {
        let err = AppError::normalize(io::Error::other("boom"), ErrorCode::UnknownError);

        assert_eq!(err.message(), "boom");
        assert_eq!(err.code(), ErrorCode::UnknownError);
        let cause = err.cause().expect("cause should be kept");
        assert!(cause.downcast_ref::<io::Error>().is_some());
        assert_eq!(cause.to_string(), "boom");
    }

    #[test]
    fn normalize_message_has_no_cause() {
        let err = AppError::normalize_message("boom", ErrorCode::UnknownError);

        assert_eq!(err.message(), "boom");
        assert!(err.cause().is_none());
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn normalize_passes_app_errors_through() {
        let original = AppError::duplicate_event("mailer", "k1");
        let err = AppError::normalize(original, ErrorCode::UnknownError);

        assert_eq!(err.code(), ErrorCode::DuplicateEvent);
        assert_eq!(err.status(), Some(409));
    }

    #[test]
    fn with_http_sets_status() {
        let err = AppError::new(ErrorCode::UnknownError, "x").with_http(418);
        assert_eq!(err.status(), Some(418));
        assert_eq!(err.status_or_default(), 418);

        let err = AppError::new(ErrorCode::LedgerUnavailable, "down");
        assert_eq!(err.status(), None);
        assert_eq!(err.status_or_default(), 503);
    }

    #[test]
    fn source_exposes_the_cause() {
        let err = AppError::new(ErrorCode::LedgerUnavailable, "ledger down")
            .with_cause(io::Error::other("connection refused"));

        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "connection refused");
    }

    #[test]
    fn codes_serialize_as_snake_case() {
        let json = serde_json::to_string(&ErrorCode::MissingIdempotencyKey).unwrap();
        assert_eq!(json, "\"missing_idempotency_key\"");
        assert_eq!(ErrorCode::DuplicateEvent.to_string(), "duplicate_event");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: normalizing a native error never loses its message.
            #[test]
            fn normalize_preserves_any_message(msg in ".{0,64}") {
                let err = AppError::normalize(io::Error::other(msg.clone()), ErrorCode::UnknownError);
                prop_assert_eq!(err.message(), msg.as_str());
                prop_assert!(err.cause().is_some());
            }
        }
    }
}
