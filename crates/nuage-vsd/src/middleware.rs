//! Error-swallowing decorator for [`RemoteControllerClient`].
//!
//! Reads of missing objects, deletes of already deleted objects and updates
//! that change nothing are expected outcomes for reconciliation code. Which
//! of them are swallowed is data ([`IgnorePolicy`]), applied in one place.

use crate::client::RemoteControllerClient;
use crate::error::{RestError, RestResult, VsdErrorCode};
use crate::types::{RestMethod, RestRequest, VsdObject};
use async_trait::async_trait;
use tracing::debug;

/// One allow-list entry: errors matching it are turned into empty success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRule {
    pub methods: Vec<RestMethod>,
    /// HTTP status to match; `None` matches any status.
    pub status: Option<u16>,
    /// VSD code to match; `None` matches any code.
    pub code: Option<VsdErrorCode>,
}

impl IgnoreRule {
    fn matches(&self, method: RestMethod, error: &RestError) -> bool {
        self.methods.contains(&method)
            && self.status.map_or(true, |s| s == error.status)
            && self.code.as_ref().map_or(true, |c| error.has_code(c))
    }
}

/// The set of errors swallowed per verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnorePolicy {
    rules: Vec<IgnoreRule>,
}

impl IgnorePolicy {
    /// A policy swallowing nothing.
    pub fn none() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: IgnoreRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns true if `error` from a `method` call must be swallowed.
    pub fn ignores(&self, method: RestMethod, error: &RestError) -> bool {
        self.rules.iter().any(|r| r.matches(method, error))
    }
}

impl Default for IgnorePolicy {
    /// GET and DELETE ignore not-found; PUT ignores "no attribute changes".
    /// POST errors always propagate.
    fn default() -> Self {
        Self::none()
            .with_rule(IgnoreRule {
                methods: vec![RestMethod::Get, RestMethod::Delete],
                status: Some(crate::error::status::NOT_FOUND),
                code: None,
            })
            .with_rule(IgnoreRule {
                methods: vec![RestMethod::Put],
                status: None,
                code: Some(VsdErrorCode::NoAttributeChanges),
            })
    }
}

/// Wraps a client and applies an [`IgnorePolicy`] to its failures.
#[derive(Debug, Clone)]
pub struct IgnoreErrors<C> {
    inner: C,
    policy: IgnorePolicy,
}

impl<C> IgnoreErrors<C> {
    /// Wraps `inner` with the default policy.
    pub fn new(inner: C) -> Self {
        Self::with_policy(inner, IgnorePolicy::default())
    }

    pub fn with_policy(inner: C, policy: IgnorePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: RemoteControllerClient> RemoteControllerClient for IgnoreErrors<C> {
    async fn request(&self, request: RestRequest) -> RestResult<Vec<VsdObject>> {
        let method = request.method;
        let path = request.path.clone();
        match self.inner.request(request).await {
            Err(e) if self.policy.ignores(method, &e) => {
                debug!(%method, %path, error = %e, "Ignoring VSD error");
                Ok(Vec::new())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Fails every call with a fixed error.
    struct Failing {
        error: RestError,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RemoteControllerClient for Failing {
        async fn request(&self, _request: RestRequest) -> RestResult<Vec<VsdObject>> {
            *self.calls.lock().unwrap() += 1;
            Err(self.error.clone())
        }
    }

    fn failing(error: RestError) -> IgnoreErrors<Failing> {
        IgnoreErrors::new(Failing {
            error,
            calls: Mutex::new(0),
        })
    }

    #[tokio::test]
    async fn test_get_not_found_is_empty() {
        let client = failing(RestError::not_found("policygroup"));
        let result = client.get("/policygroups/pg-1", None).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(*client.inner().calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_ok() {
        let client = failing(RestError::not_found("vport"));
        assert!(client.delete("/vports/vp-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_post_not_found_propagates() {
        let client = failing(RestError::not_found("domain"));
        let err = client
            .post("/domains/d-1/policygroups", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_no_changes_is_ok() {
        let client = failing(RestError::conflict(VsdErrorCode::NoAttributeChanges, "nothing to do"));
        assert!(client.put("/vports/vp-1", serde_json::json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_conflict_propagates() {
        let client = failing(RestError::conflict(VsdErrorCode::PolicyGroupInUse, "in use"));
        assert!(client.get("/policygroups", None).await.is_err());
    }

    #[test]
    fn test_empty_policy_ignores_nothing() {
        let policy = IgnorePolicy::none();
        assert!(!policy.ignores(RestMethod::Get, &RestError::not_found("x")));
    }
}
