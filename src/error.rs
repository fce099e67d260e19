//! Crate-level error taxonomy.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Core layer (`crate::error`)
//!
//! - [`Error`]: the operation-level taxonomy every public broker operation
//!   returns. The surface layer (HTTP handlers, CLI, both out of scope
//!   here) maps it to status codes via [`Error::http_status`].
//!
//! ## Backend layers
//!
//! - [`crate::substrate::SubstrateError`]: typed errors of the replicated-log
//!   substrate, converted upward via `From`
//! - [`crate::metadata::MetadataError`]: metadata-store errors, converted
//!   upward via `From`
//!
//! # Propagation policy
//!
//! User-facing validation failures are `Invalid` and are never logged at
//! error level. Background loops never propagate errors across tasks; they
//! log with a stable `[tenant: <name>]<task>: <msg>` prefix and continue.
//! Notification and audit-log failures are always non-fatal.

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::substrate::SubstrateError;

pub type Result<T> = std::result::Result<T, Error>;

/// Operation-level errors returned by the broker core.
#[derive(Debug, Error)]
pub enum Error {
    /// User-visible validation failure; surfaced as a showable 400.
    #[error("{0}")]
    Invalid(String),

    /// Station/producer/consumer/DLS record absent; surfaced as 404.
    #[error("{0}")]
    NotFound(String),

    /// Unique-constraint violation; surfaced as a showable 400.
    #[error("{0}")]
    AlreadyExists(String),

    /// A substrate jsapi request exceeded its hard deadline.
    #[error("substrate request timed out: {0}")]
    Timeout(String),

    /// The substrate returned a typed error.
    #[error(transparent)]
    Substrate(SubstrateError),

    /// Metadata DB or substrate unavailability in a background loop; logged
    /// at warn and retried on the next tick or redelivery.
    #[error("transient: {0}")]
    Transient(String),

    /// Startup-time inability to create internal resources or bind the
    /// background subscriptions; the process must not proceed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True when the message is safe to show verbatim to an end user.
    pub fn is_showable(&self) -> bool {
        matches!(
            self,
            Error::Invalid(_) | Error::NotFound(_) | Error::AlreadyExists(_)
        )
    }

    /// Status-code hint for the out-of-scope HTTP layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Invalid(_) | Error::AlreadyExists(_) => 400,
            Error::NotFound(_) => 404,
            Error::Timeout(_)
            | Error::Substrate(_)
            | Error::Transient(_)
            | Error::Fatal(_) => 500,
        }
    }

    /// True when a background loop should retry rather than give up.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transient(_))
            || matches!(self, Error::Substrate(e) if e.is_retriable())
    }
}

impl From<SubstrateError> for Error {
    fn from(e: SubstrateError) -> Self {
        match e {
            SubstrateError::Timeout { .. } => Error::Timeout(e.to_string()),
            other => Error::Substrate(other),
        }
    }
}

impl From<MetadataError> for Error {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound(what) => Error::NotFound(what),
            MetadataError::AlreadyExists(what) => Error::AlreadyExists(what),
            MetadataError::Unavailable(msg) => Error::Transient(msg),
        }
    }
}
