//! Typed client abstractions for the Nuage VSD REST API.
//!
//! The crate is organized into several modules:
//!
//! - [`types`]: request, verb and response entity types
//! - [`error`]: [`RestError`] and the VSD error codes callers branch on
//! - [`api`]: entity kinds, REST paths and the `X-Nuage-Filter` builder
//! - [`client`]: the [`RemoteControllerClient`] trait
//! - [`middleware`]: [`IgnoreErrors`], the allow-list of swallowed errors
//! - [`http`]: [`HttpClient`], the reqwest transport
//!
//! # Example
//!
//! ```ignore
//! use nuage_vsd::{api::{NuageFilter, Resource}, IgnoreErrors, HttpClient, RemoteControllerClient};
//!
//! let client = IgnoreErrors::new(HttpClient::new(config)?);
//! let groups = client
//!     .get(&Resource::PolicyGroup.collection_path(),
//!          Some(&NuageFilter::eq("externalID", "sg-1@cms")))
//!     .await?;
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod http;
pub mod middleware;
pub mod types;

pub use api::{NuageFilter, Resource};
pub use client::RemoteControllerClient;
pub use error::{RestError, RestResult, VsdErrorCode};
pub use http::{HttpClient, HttpClientConfig};
pub use middleware::{IgnoreErrors, IgnorePolicy, IgnoreRule};
pub use types::{RestMethod, RestRequest, VsdObject};
