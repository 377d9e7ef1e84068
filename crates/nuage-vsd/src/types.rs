//! Request and response types shared by every VSD client.

use crate::api::filter::{NuageFilter, FILTER_HEADER};
use crate::error::{RestError, RestResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// REST verb of a VSD request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl RestMethod {
    /// Returns true for verbs that change VSD state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, RestMethod::Get)
    }
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestMethod::Get => "GET",
            RestMethod::Post => "POST",
            RestMethod::Put => "PUT",
            RestMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// A single VSD REST request.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: RestMethod,
    /// Path below the API root, e.g. `/domains/<id>/policygroups`.
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl RestRequest {
    pub fn new(method: RestMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds an `X-Nuage-Filter` header when a filter is given.
    pub fn with_filter(self, filter: Option<&NuageFilter>) -> Self {
        match filter {
            Some(filter) if !filter.is_empty() => self.with_header(FILTER_HEADER, filter.to_string()),
            _ => self,
        }
    }

    /// Returns the value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One VSD entity as returned in a response body.
///
/// VSD answers every call with a list of loosely typed JSON objects; this
/// wrapper gives typed access to the handful of attributes every entity has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VsdObject(Map<String, Value>);

impl VsdObject {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Serializes any value into an object.
    pub fn from_serialize<T: Serialize>(value: &T) -> RestResult<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| RestError::transport(format!("failed to encode request: {}", e)))?;
        Self::from_value(value)
            .ok_or_else(|| RestError::transport("request body is not a JSON object"))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a string attribute, treating JSON null as absent.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn id(&self) -> Option<&str> {
        self.str("ID")
    }

    /// Returns the id, failing when VSD returned an entity without one.
    pub fn require_id(&self) -> RestResult<String> {
        self.id()
            .map(str::to_string)
            .ok_or_else(|| RestError::transport("VSD returned an object without an ID"))
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.str("parentID")
    }

    pub fn parent_type(&self) -> Option<&str> {
        self.str("parentType")
    }

    pub fn external_id(&self) -> Option<&str> {
        self.str("externalID")
    }

    pub fn name(&self) -> Option<&str> {
        self.str("name")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Decodes the entity into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> RestResult<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| RestError::transport(format!("unexpected VSD object: {}", e)))
    }
}

impl From<Map<String, Value>> for VsdObject {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_object_accessors() {
        let obj = VsdObject::from_value(json!({
            "ID": "pg-1",
            "parentID": "dom-1",
            "parentType": "domain",
            "externalID": "sg-1@cms",
            "external": false,
        }))
        .unwrap();
        assert_eq!(obj.id(), Some("pg-1"));
        assert_eq!(obj.parent_type(), Some("domain"));
        assert_eq!(obj.external_id(), Some("sg-1@cms"));
        assert_eq!(obj.bool("external"), Some(false));
        assert_eq!(obj.require_id().unwrap(), "pg-1");
    }

    #[test]
    fn test_object_without_id() {
        let obj = VsdObject::new().with("name", "x");
        assert!(obj.require_id().is_err());
        assert!(VsdObject::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn test_request_filter_header() {
        let filter = NuageFilter::eq("externalID", "sg-1@cms");
        let req = RestRequest::new(RestMethod::Get, "/policygroups").with_filter(Some(&filter));
        assert_eq!(req.header("x-nuage-filter"), Some("externalID IS 'sg-1@cms'"));

        let bare = RestRequest::new(RestMethod::Get, "/policygroups").with_filter(None);
        assert!(bare.headers.is_empty());
    }
}
