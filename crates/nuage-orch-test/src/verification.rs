//! Verification helpers for asserting VSD state after an operation

use crate::FakeVsd;
use nuage_vsd::{Resource, VsdObject};
use serde_json::Value;
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected object '{id}' not found")]
    ObjectNotFound { id: String },

    #[error("Object '{id}' still exists")]
    ObjectStillExists { id: String },

    #[error("Expected field '{field}' not found on '{id}'")]
    FieldNotFound { id: String, field: String },

    #[error("Value mismatch for {id}:{field}: expected '{expected}', got '{actual}'")]
    ValueMismatch {
        id: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Expected {expected} {kind} objects, found {actual}")]
    CountMismatch {
        kind: String,
        expected: usize,
        actual: usize,
    },

    #[error("No {kind} with externalID '{external_id}'")]
    ExternalIdNotFound { kind: String, external_id: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Assertions over the state of a [`FakeVsd`]
pub struct VsdVerifier<'a> {
    vsd: &'a FakeVsd,
}

impl<'a> VsdVerifier<'a> {
    pub fn new(vsd: &'a FakeVsd) -> Self {
        Self { vsd }
    }

    /// Verify that an object exists and return it
    pub fn assert_exists(&self, id: &str) -> VerifyResult<VsdObject> {
        self.vsd
            .object(id)
            .ok_or_else(|| VerificationError::ObjectNotFound { id: id.to_string() })
    }

    /// Verify that an object is gone
    pub fn assert_absent(&self, id: &str) -> VerifyResult<()> {
        match self.vsd.object(id) {
            Some(_) => Err(VerificationError::ObjectStillExists { id: id.to_string() }),
            None => Ok(()),
        }
    }

    /// Verify a field value of an object
    pub fn assert_field(&self, id: &str, field: &str, expected: Value) -> VerifyResult<()> {
        let object = self.assert_exists(id)?;
        let actual = object.get(field).ok_or_else(|| VerificationError::FieldNotFound {
            id: id.to_string(),
            field: field.to_string(),
        })?;
        if *actual != expected {
            return Err(VerificationError::ValueMismatch {
                id: id.to_string(),
                field: field.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Verify the number of objects of a kind
    pub fn assert_count(&self, kind: Resource, expected: usize) -> VerifyResult<()> {
        let actual = self.vsd.count(kind);
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                kind: kind.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify the number of children of a kind under a parent
    pub fn assert_child_count(&self, parent_id: &str, kind: Resource, expected: usize) -> VerifyResult<()> {
        let actual = self.vsd.children(parent_id, kind).len();
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                kind: format!("{} under {}", kind, parent_id),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Find an object of a kind by externalID
    pub fn find_by_external_id(&self, kind: Resource, external_id: &str) -> VerifyResult<VsdObject> {
        self.vsd
            .objects(kind)
            .into_iter()
            .find(|o| o.external_id() == Some(external_id))
            .ok_or_else(|| VerificationError::ExternalIdNotFound {
                kind: kind.to_string(),
                external_id: external_id.to_string(),
            })
    }
}
