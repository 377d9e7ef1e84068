//! Port lifecycle on the VSD.
//!
//! A port with at least one fixed IP on a mapped subnet is represented by a
//! vport under the VSD subnet. When the port is bound to a compute host and
//! its owner class runs a VM, a VSD VM (or another interface on the VM of
//! the same device) is attached to the vport.
//!
//! ```text
//!  create(port)                  update(original, port)         delete(port)
//!     │ validate                    │ ips appear/vanish ──> create/delete
//!     ▼                             │ ip/mac change ──> vminterface
//!   vport ──> VM / vminterface      │ host bound/unbound ──> VM
//!     │                             │ port security ──> allow-all group
//!     ▼                             ▼
//!  Notifier (shared ledger)      Notifier                    VM, vport, Notifier
//! ```
//!
//! Ports without port security and without security groups get the
//! allow-all policy group of their domain.

mod orch;
pub mod types;

pub use orch::{PortLifecycle, PortLifecycleConfig, PortLifecycleStats};
pub use types::{FixedIp, Port, PortBinding};
