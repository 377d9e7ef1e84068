//! The client interface every VSD consumer programs against.

use crate::api::filter::NuageFilter;
use crate::error::RestResult;
use crate::types::{RestMethod, RestRequest, VsdObject};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A connection to the VSD REST API.
///
/// Implementors only provide [`request`](Self::request); the verb helpers
/// build requests and route them through it, so decorators such as
/// [`IgnoreErrors`](crate::IgnoreErrors) see every call.
#[async_trait]
pub trait RemoteControllerClient: Send + Sync {
    /// Executes one request and returns the entities in the response body.
    async fn request(&self, request: RestRequest) -> RestResult<Vec<VsdObject>>;

    async fn get(&self, path: &str, filter: Option<&NuageFilter>) -> RestResult<Vec<VsdObject>> {
        self.request(RestRequest::new(RestMethod::Get, path).with_filter(filter))
            .await
    }

    /// Returns the first entity of a GET, if any.
    async fn get_one(&self, path: &str, filter: Option<&NuageFilter>) -> RestResult<Option<VsdObject>> {
        Ok(self.get(path, filter).await?.into_iter().next())
    }

    async fn post(&self, path: &str, body: Value) -> RestResult<Vec<VsdObject>> {
        self.request(RestRequest::new(RestMethod::Post, path).with_body(body))
            .await
    }

    async fn put(&self, path: &str, body: Value) -> RestResult<()> {
        self.request(RestRequest::new(RestMethod::Put, path).with_body(body))
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> RestResult<()> {
        self.request(RestRequest::new(RestMethod::Delete, path))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<T: RemoteControllerClient + ?Sized> RemoteControllerClient for Arc<T> {
    async fn request(&self, request: RestRequest) -> RestResult<Vec<VsdObject>> {
        (**self).request(request).await
    }
}
