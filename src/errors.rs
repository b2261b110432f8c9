//! Error types for the Knit-Internal crate.
//!
//! This module defines a unified error enumeration used across the stores,
//! the projection engine, the loop workers, and the HTTP handlers. It
//! integrates with `thiserror` to provide rich `Display` implementations
//! and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants cover lookup, conflict, state-machine, cluster, auth and
//!   request-validation failures.

use thiserror::Error;

use crate::domain::run::KnitRunStatus;

#[derive(Error, Debug)]
/// Unified error enumeration for the Knit-Internal library.
///
/// - Used across stores, projection, loop workers and HTTP handlers.
/// - Implements `std::error::Error` via `thiserror`.
pub enum KnitError {
    /// Entity (data, run, plan, PVC, ...) does not exist.
    #[error("{0} is missing")]
    Missing(String),

    /// Duplicate name or an otherwise conflicting registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A cluster resource did not become ready in time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Attempted an illegal run status transition.
    #[error("run {run_id} cannot change status: {from} -> {to}")]
    InvalidRunStateChanging {
        run_id: String,
        from: KnitRunStatus,
        to: KnitRunStatus,
    },

    /// Signature or keychain verification failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed request payload or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// I/O error from an underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KnitError {
    pub fn missing(what: impl Into<String>) -> Self {
        KnitError::Missing(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        KnitError::Conflict(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        KnitError::DeadlineExceeded(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        KnitError::Unauthorized(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        KnitError::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KnitError::Internal(msg.into())
    }

    /// Whether this error denotes an absent entity.
    pub fn is_missing(&self) -> bool {
        matches!(self, KnitError::Missing(_))
    }

    /// Whether this error denotes a name or registration collision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KnitError::Conflict(_))
    }
}
