//! HTTP transport for the VSD REST API, built on reqwest.
//!
//! Session negotiation is not handled here: the caller supplies the value of
//! the `Authorization` header obtained out of band.

use crate::client::RemoteControllerClient;
use crate::error::{RestError, RestResult, VsdErrorBody};
use crate::types::{RestMethod, RestRequest, VsdObject};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Connection settings for [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Scheme, host and port, e.g. `https://vsd.example.net:8443`.
    pub server: String,
    /// API root below the server, e.g. `/nuage/api/v6`.
    pub base_uri: String,
    pub organization: String,
    /// Value sent in the `Authorization` header.
    pub authorization: String,
    pub timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            server: "https://localhost:8443".to_string(),
            base_uri: "/nuage/api/v6".to_string(),
            organization: "csp".to_string(),
            authorization: String::new(),
            timeout_secs: 30,
        }
    }
}

/// A [`RemoteControllerClient`] speaking HTTP to a VSD.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> RestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RestError::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.config.server.trim_end_matches('/'),
            self.config.base_uri.trim_end_matches('/'),
            path
        )
    }
}

/// Turns a successful response body into entities.
fn parse_body(body: &str) -> RestResult<Vec<VsdObject>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| RestError::transport(format!("invalid VSD response: {}", e)))?;
    Ok(match value {
        Value::Array(items) => items.into_iter().filter_map(VsdObject::from_value).collect(),
        other => VsdObject::from_value(other).into_iter().collect(),
    })
}

/// Turns a failed response into a [`RestError`].
fn parse_error(status: u16, body: &str) -> RestError {
    match serde_json::from_str::<VsdErrorBody>(body) {
        Ok(parsed) => parsed.into_error(status),
        Err(_) => RestError::new(status, body.trim().to_string()),
    }
}

#[async_trait]
impl RemoteControllerClient for HttpClient {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn request(&self, request: RestRequest) -> RestResult<Vec<VsdObject>> {
        let method = match request.method {
            RestMethod::Get => reqwest::Method::GET,
            RestMethod::Post => reqwest::Method::POST,
            RestMethod::Put => reqwest::Method::PUT,
            RestMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self
            .http
            .request(method, self.url(&request.path))
            .header("X-Nuage-Organization", &self.config.organization)
            .header("Authorization", &self.config.authorization)
            .header("Content-Type", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RestError::transport(format!("request failed: {}", e)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RestError::transport(format!("failed to read response: {}", e)))?;

        if (200..300).contains(&status) {
            debug!(status, "VSD request succeeded");
            parse_body(&text)
        } else {
            let error = parse_error(status, &text);
            warn!(status, error = %error, "VSD request failed");
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VsdErrorCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_url_joining() {
        let client = HttpClient::new(HttpClientConfig {
            server: "https://vsd:8443/".to_string(),
            base_uri: "/nuage/api/v6/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.url("/policygroups/pg-1"),
            "https://vsd:8443/nuage/api/v6/policygroups/pg-1"
        );
    }

    #[test]
    fn test_parse_body_variants() {
        assert!(parse_body("").unwrap().is_empty());
        let list = parse_body(r#"[{"ID":"a"},{"ID":"b"}]"#).unwrap();
        assert_eq!(list.len(), 2);
        let single = parse_body(r#"{"ID":"a"}"#).unwrap();
        assert_eq!(single[0].id(), Some("a"));
        assert!(parse_body("not json").is_err());
    }

    #[test]
    fn test_parse_error_variants() {
        let err = parse_error(409, r#"{"errors":[],"description":"exists","internalErrorCode":"9501"}"#);
        assert!(err.is_conflict_with(&VsdErrorCode::PolicyGroupExists));
        assert_eq!(err.message, "exists");

        let raw = parse_error(500, "boom");
        assert_eq!(raw.status, 500);
        assert_eq!(raw.message, "boom");
        assert!(raw.code.is_none());
    }
}
