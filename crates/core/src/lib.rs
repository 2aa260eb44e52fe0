//! `pulse-core`: shared building blocks for the event core.
//!
//! This crate contains the error model and identifier types (no I/O, no async).

pub mod error;
pub mod id;

pub use error::{AppError, AppResult, ErrorCause, ErrorCode};
pub use id::{EventId, TenantId};
