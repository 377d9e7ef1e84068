//! VSD API vocabulary.
//!
//! - [`resource`]: entity kinds and the REST paths built from them
//! - [`filter`]: the `X-Nuage-Filter` query language

pub mod filter;
pub mod resource;

pub use filter::{NuageFilter, FILTER_HEADER};
pub use resource::Resource;
