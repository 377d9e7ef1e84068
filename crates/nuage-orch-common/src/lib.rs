//! Common orchestration primitives for the Nuage adapter.
//!
//! The managers in `nuage-orchagent` build on three small pieces:
//!
//! - [`RetryPolicy`] and [`retry`]: bounded retries for transient races
//!   (priority collisions, a dual-stack partner that is not mapped yet)
//! - [`RollbackLedger`] and [`Compensator`]: an ordered record of the remote
//!   effects of one operation, undone in reverse when a later step fails
//! - [`ErrorKind`]: the stable classification callers branch on
//!
//! # Example
//!
//! ```ignore
//! use nuage_orch_common::{RollbackLedger, RetryPolicy, retry};
//!
//! let mut ledger = RollbackLedger::new();
//! match build(&mut ledger).await {
//!     Ok(value) => Ok(value),
//!     Err(e) => {
//!         ledger.unwind(&compensator).await;
//!         Err(e)
//!     }
//! }
//! ```

mod kind;
mod retry;
mod rollback;

pub use kind::ErrorKind;
pub use retry::{retry, RetryError, RetryPolicy};
pub use rollback::{Compensator, RollbackFailure, RollbackLedger};
