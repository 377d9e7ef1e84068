//! VSD error types and status handling.
//!
//! Every failed REST call is reported as a [`RestError`] carrying the HTTP
//! status and, when VSD supplies one, its `internalErrorCode`. Callers decide
//! on retries and re-resolution by inspecting both.

use serde::Deserialize;
use std::fmt;

/// HTTP status codes VSD callers branch on.
pub mod status {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// VSD-specific error codes (`internalErrorCode` in the error body).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VsdErrorCode {
    /// A policy group with the same external id already exists in the domain.
    PolicyGroupExists,
    /// An enterprise network macro with the same address already exists.
    NetworkMacroExists,
    /// Another ACL entry in the template already uses the priority.
    PriorityConflict,
    /// Another ACL template in the domain already uses the priority.
    DuplicateAclPriority,
    /// The policy group still has vports attached.
    PolicyGroupInUse,
    /// The VM was already resynced with the requested interfaces.
    VmAlreadyResync,
    /// An update carried no attribute that differs from the stored object.
    NoAttributeChanges,
    /// The group already has a permission on the object.
    PermissionExists,
    /// Any code this client does not classify.
    Other(String),
}

impl VsdErrorCode {
    /// Classifies a raw code as returned by VSD.
    pub fn from_code(code: &str) -> Self {
        match code {
            "9501" => VsdErrorCode::PolicyGroupExists,
            "2504" => VsdErrorCode::NetworkMacroExists,
            "2591" => VsdErrorCode::PriorityConflict,
            "2640" => VsdErrorCode::DuplicateAclPriority,
            "2521" => VsdErrorCode::PolicyGroupInUse,
            "2715" => VsdErrorCode::VmAlreadyResync,
            "2039" => VsdErrorCode::NoAttributeChanges,
            "4504" => VsdErrorCode::PermissionExists,
            other => VsdErrorCode::Other(other.to_string()),
        }
    }

    /// Returns the raw code.
    pub fn as_str(&self) -> &str {
        match self {
            VsdErrorCode::PolicyGroupExists => "9501",
            VsdErrorCode::NetworkMacroExists => "2504",
            VsdErrorCode::PriorityConflict => "2591",
            VsdErrorCode::DuplicateAclPriority => "2640",
            VsdErrorCode::PolicyGroupInUse => "2521",
            VsdErrorCode::VmAlreadyResync => "2715",
            VsdErrorCode::NoAttributeChanges => "2039",
            VsdErrorCode::PermissionExists => "4504",
            VsdErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for VsdErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a VSD REST call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestError {
    /// HTTP status, or 0 when the request never reached the server.
    pub status: u16,
    /// VSD internal error code, when present.
    pub code: Option<VsdErrorCode>,
    pub message: String,
}

impl RestError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Attaches a VSD error code.
    pub fn with_code(mut self, code: VsdErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Creates a 404 error for `resource`.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            status::NOT_FOUND,
            format!("{} could not be found", resource.into()),
        )
    }

    /// Creates a 409 error carrying `code`.
    pub fn conflict(code: VsdErrorCode, message: impl Into<String>) -> Self {
        Self::new(status::CONFLICT, message).with_code(code)
    }

    /// Creates an error for a transport failure or an unreadable response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == status::NOT_FOUND
    }

    pub fn is_conflict(&self) -> bool {
        self.status == status::CONFLICT
    }

    /// Returns true if the error carries `code`, whatever the HTTP status.
    pub fn has_code(&self, code: &VsdErrorCode) -> bool {
        self.code.as_ref() == Some(code)
    }

    /// Returns true for a 409 carrying `code`.
    pub fn is_conflict_with(&self, code: &VsdErrorCode) -> bool {
        self.is_conflict() && self.has_code(code)
    }
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VSD error {}", self.status)?;
        if let Some(code) = &self.code {
            write!(f, " (code {})", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for RestError {}

/// Result type for VSD REST calls.
pub type RestResult<T> = Result<T, RestError>;

/// Error body as returned by VSD for failed requests.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct VsdErrorBody {
    #[serde(default)]
    pub errors: Vec<VsdErrorEntry>,
    #[serde(default, rename = "internalErrorCode")]
    pub internal_error_code: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct VsdErrorEntry {
    #[serde(default)]
    pub descriptions: Vec<VsdErrorDescription>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct VsdErrorDescription {
    #[serde(default)]
    pub description: String,
}

impl VsdErrorBody {
    /// Converts a parsed body into a [`RestError`] for `status`.
    pub(crate) fn into_error(self, status: u16) -> RestError {
        let mut messages: Vec<String> = self
            .errors
            .into_iter()
            .flat_map(|e| e.descriptions.into_iter().map(|d| d.description))
            .filter(|d| !d.is_empty())
            .collect();
        if messages.is_empty() {
            if let Some(description) = self.description {
                messages.push(description);
            }
        }
        let code = self.internal_error_code.and_then(|v| match v {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s),
            _ => None,
        });

        let mut error = RestError::new(status, messages.join("; "));
        if let Some(code) = code {
            error = error.with_code(VsdErrorCode::from_code(&code));
        }
        error
    }
}
