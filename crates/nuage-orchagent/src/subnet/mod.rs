//! Subnet lifecycle on the VSD.
//!
//! A local subnet on a VXLAN network is backed by one of three VSD objects:
//!
//! - an L2 domain this agent provisions (openstack-managed)
//! - a pre-existing L2 domain or L3 subnet the subnet links to (VSD-managed,
//!   selected with `nuagenet` and `net_partition`)
//! - a floating IP shared network resource, for `router:external` networks
//!
//! # Dual stack
//!
//! A network carries at most one IPv4 and one IPv6 subnet, and both share a
//! single L2 domain. The IPv4 subnet provisions the domain; the IPv6 subnet
//! switches it to `DUALSTACK`. When the IPv6 subnet arrives first it is
//! recorded locally only, and the IPv4 subnet later provisions both halves.
//! If the IPv4 mapping is not visible yet when the IPv6 subnet is created,
//! creation is retried under [`SubnetLifecycleConfig::dualstack_retry`].
//!
//! ```text
//!  create(subnet)
//!     │ validate_create (no remote calls)
//!     ├── nuagenet set ──────> link VSD subnet ──> grant tenant group
//!     ├── router:external ───> shared network resource
//!     └── otherwise ─────────> [retry] L2 domain template + L2 domain
//!                                       + ACL templates + group grant
//!     │
//!     ▼
//!  SubnetMapping ──> LocalMappingStore ──> Notifier (AfterCreate)
//! ```
//!
//! Every multi-step create runs on a rollback ledger, so a failure leaves
//! neither remote objects nor reserved DHCP ports behind.

mod orch;
pub mod types;

pub use orch::{SubnetLifecycle, SubnetLifecycleConfig, SubnetLifecycleStats};
pub use types::{HostRoute, Network, Segment, Subnet};
