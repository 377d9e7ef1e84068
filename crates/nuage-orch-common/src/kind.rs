//! Error classification shared by all managers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable classification of a failed operation.
///
/// Every manager error maps onto exactly one kind, so callers (and the audit
/// trail) can branch on the kind without matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request was malformed or asked for something unsupported.
    Validation,
    /// The request collides with existing state.
    Conflict,
    /// A referenced object does not exist.
    NotFound,
    /// A race with a concurrent writer that is expected to resolve itself.
    TransientRace,
    /// Undoing a partially applied operation failed.
    RollbackFailure,
    /// The remote controller rejected the request or was unreachable.
    Remote,
    /// Local storage or an invariant of this process failed.
    Internal,
}

impl ErrorKind {
    /// Returns the stable string code for this kind.
    pub const fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientRace => "transient_race",
            ErrorKind::RollbackFailure => "rollback_failure",
            ErrorKind::Remote => "remote_error",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Returns true if repeating the operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientRace)
    }

    /// Returns true if the caller's request, not the system, is at fault.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::NotFound
        )
    }

    /// HTTP status an API front end would answer with.
    pub const fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::TransientRace => 503,
            ErrorKind::RollbackFailure | ErrorKind::Remote | ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorKind::Validation.code(), "validation_error");
        assert_eq!(ErrorKind::Conflict.to_string(), "conflict");
        assert_eq!(ErrorKind::RollbackFailure.code(), "rollback_failure");
    }

    #[test]
    fn test_classification() {
        assert!(ErrorKind::TransientRace.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(ErrorKind::NotFound.is_client_error());
        assert!(!ErrorKind::Remote.is_client_error());
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }
}
