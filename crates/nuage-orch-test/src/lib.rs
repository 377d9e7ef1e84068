//! Integration test infrastructure for the Nuage agent
//!
//! Provides:
//! - An in-memory VSD implementing the REST client trait
//! - Fault injection and request logging
//! - Seeded VSD topologies for common scenarios
//! - VSD state verification helpers

mod fake_vsd;
pub mod fixtures;
mod verification;

pub use fake_vsd::{FakeVsd, Fault};
pub use fixtures::*;
pub use verification::*;
