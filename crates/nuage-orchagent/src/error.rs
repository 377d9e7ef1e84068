//! Error type shared by every manager.

use nuage_orch_common::{ErrorKind, RollbackFailure};
use nuage_vsd::error::status;
use nuage_vsd::RestError;
use std::fmt;
use thiserror::Error;

pub type OrchResult<T> = Result<T, OrchError>;

#[derive(Debug, Error)]
pub enum OrchError {
    /// Caller supplied data that violates a structural rule.
    #[error("Bad request: {0}")]
    Validation(String),

    #[error("Nuage Plugin does not support this operation: {0}")]
    OperationNotSupported(String),

    /// A remote collision that retry or re-resolution did not settle.
    #[error("{0}")]
    Conflict(String),

    #[error("{resource} {id} could not be found")]
    NotFound { resource: String, id: String },

    /// The other half of a dual-stack pair is not visible yet.
    #[error("{0} could not be found so retrying")]
    DualstackSubnetNotFound(String),

    #[error(
        "Unable to complete operation on port {port_id}, port is already bound, \
         port type: {vif_type}, old_ips {old_ips}, new_ips {new_ips}."
    )]
    PortBound {
        port_id: String,
        vif_type: String,
        old_ips: String,
        new_ips: String,
    },

    #[error(transparent)]
    Remote(#[from] RestError),

    #[error("Mapping store error: {0}")]
    Store(String),

    /// The original failure plus the compensating actions that failed while
    /// unwinding it.
    #[error("{original} (rollback incomplete: {})", failures.join("; "))]
    RollbackFailed {
        original: Box<OrchError>,
        failures: Vec<String>,
    },

    #[error("{0}")]
    Internal(String),
}

impl OrchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        OrchError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        OrchError::Conflict(msg.into())
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        OrchError::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Classifies the error for callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchError::Validation(_) | OrchError::OperationNotSupported(_) => ErrorKind::Validation,
            OrchError::Conflict(_) | OrchError::PortBound { .. } => ErrorKind::Conflict,
            OrchError::NotFound { .. } => ErrorKind::NotFound,
            OrchError::DualstackSubnetNotFound(_) => ErrorKind::TransientRace,
            OrchError::Remote(e) => match e.status {
                status::NOT_FOUND => ErrorKind::NotFound,
                status::CONFLICT => ErrorKind::Conflict,
                _ => ErrorKind::Remote,
            },
            OrchError::RollbackFailed { .. } => ErrorKind::RollbackFailure,
            OrchError::Store(_) | OrchError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable code string, e.g. `validation_error`.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// The VSD error behind this failure, if any.
    pub fn remote(&self) -> Option<&RestError> {
        match self {
            OrchError::Remote(e) => Some(e),
            OrchError::RollbackFailed { original, .. } => original.remote(),
            _ => None,
        }
    }

    /// The error that started a failed rollback, or `self`.
    pub fn original(&self) -> &OrchError {
        match self {
            OrchError::RollbackFailed { original, .. } => original,
            other => other,
        }
    }

    /// Combines an error with the failures of the unwind it triggered.
    ///
    /// Returns `original` untouched when every compensating action ran.
    pub fn with_rollback<A, E>(original: OrchError, failures: Vec<RollbackFailure<A, E>>) -> OrchError
    where
        A: fmt::Debug,
        E: fmt::Display,
    {
        if failures.is_empty() {
            return original;
        }
        OrchError::RollbackFailed {
            original: Box::new(original),
            failures: failures
                .iter()
                .map(|f| format!("{:?}: {}", f.action, f.error))
                .collect(),
        }
    }
}
