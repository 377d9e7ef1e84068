//! Nuage Orchagent - VSD Control-Plane Adapter
//!
//! Keeps a Nuage VSD in sync with the networks, subnets, ports and security
//! groups of a cloud networking API. Local life-cycle events come in through
//! [`SubnetLifecycle`] and [`PortLifecycle`]; security groups are translated
//! into VSD policy groups and ACL entries by the [`policy`] module.
//!
//! # Architecture
//!
//! ```text
//!  subnet/port events        security groups
//!         │                        │
//!         ▼                        ▼
//!  SubnetLifecycle ──┐    PolicyGroupManager ──> RuleMapper
//!  PortLifecycle ────┼──> ExternalGroupManager    PriorityAllocator
//!         │          │    RedirectTargetManager   StatefulIcmpPolicy
//!         ▼          ▼             │
//!  LocalMappingStore  Notifier     ▼
//!  NetworkCatalog            RemoteControllerClient ──> VSD
//! ```
//!
//! # Consistency
//!
//! VSD calls are not transactional. Every multi-step operation records the
//! inverse of each completed step on a [`rollback::Ledger`]; on failure the
//! ledger is unwound in reverse order before the error is returned.
//!
//! # Feature Flags
//!
//! - `full` (default): every module
//! - `mod-external`: external security groups and their rules
//! - `mod-redirect`: redirect targets and advanced forwarding rules

pub mod audit;
pub mod config;
pub mod error;
pub mod notify;
pub mod policy;
pub mod port;
pub mod rollback;
pub mod store;
pub mod subnet;
pub mod vsd;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{AgentConfig, ConfigError, DualstackRetryConfig, PriorityConfig};
pub use error::{OrchError, OrchResult};
pub use notify::{EventPhase, LifecycleEvent, NotificationHook, Notifier};
pub use policy::{
    AclDirection, AclEntry, PolicyGroupConfig, PolicyGroupKind, PolicyGroupManager, PriorityAllocator, RuleMapper,
    SecurityGroup, SecurityRule,
};
pub use port::{Port, PortLifecycle, PortLifecycleConfig, PortLifecycleStats};
pub use store::{InMemoryStore, LocalMappingStore, NetPartition, NetworkCatalog, SubnetMapping, VsdSubnetKind};
pub use subnet::{Network, Subnet, SubnetLifecycle, SubnetLifecycleConfig, SubnetLifecycleStats};

pub use nuage_types::{IpAddress, IpPrefix, IpVersion, MacAddress};
pub use nuage_vsd::{RemoteControllerClient, Resource, RestError, VsdObject};
