//! Security policy on the VSD.
//!
//! This module turns security groups and their rules into VSD policy groups
//! and ACL entries:
//! - Rule validation and translation into ACL entry bodies
//! - Random entry priorities with bounded collision retries
//! - Reverse entries for ICMP types the VSD cannot track
//! - Policy group materialization per domain, with rollback on failure
//! - External groups and redirect targets
//!
//! # Direction
//!
//! A security group rule is written from the VM's point of view while VSD
//! ACL templates are written from the domain's, so `ingress` rules land in
//! the egress template and the other way around. External group rules are
//! the exception and keep their direction.
//!
//! # Architecture
//!
//! ```text
//! SecurityGroup + [SecurityRule]
//!        │ normalize()
//!        ▼
//!    RuleMatch ──> RuleMapper ──> AclEntry
//!                     │               │
//!          StatefulIcmpPolicy   PriorityAllocator
//!                                     │
//!                                     ▼
//!                     PolicyGroupManager ──> RemoteControllerClient
//!                     ExternalGroupManager        │
//!                     RedirectTargetManager       ▼
//!                                                VSD
//! ```
//!
//! # Key Components
//!
//! - [`RuleMapper`]: pure rule to ACL entry translation
//! - [`PriorityAllocator`]: priority draws and collision retries
//! - [`PolicyGroupManager`]: ensure, delete and garbage-collect policy groups
//! - [`ExternalGroupManager`]: external groups and their rules
//! - [`RedirectTargetManager`]: redirect targets and forwarding rules

#[cfg(feature = "mod-external")]
mod external;
mod mapper;
mod policy_group;
mod priority;
#[cfg(feature = "mod-redirect")]
mod redirect;
mod stateful;
pub mod types;

#[cfg(feature = "mod-external")]
pub use external::{
    ExternalGroup, ExternalGroupManager, ExternalGroupQuery, ExternalGroupRequest, ExternalGroupStats,
    ExternalRule, ExternalRuleRequest,
};
pub use mapper::{port_range, MappingTarget, ResolvedRemote, RuleMapper};
pub use policy_group::{PolicyGroupConfig, PolicyGroupManager, PolicyGroupStats};
pub use priority::PriorityAllocator;
#[cfg(feature = "mod-redirect")]
pub use redirect::{
    InsertionMode, RedirectAction, RedirectRule, RedirectRuleRequest, RedirectTarget, RedirectTargetManager,
    RedirectTargetRequest, RedirectTargetStats,
};
pub use stateful::{icmp_trackable, needs_reverse, stateful_icmp_types};
pub use types::{
    AclDirection, AclEntry, Direction, EtherType, PolicyGroupKind, Protocol, ProtocolSpec, RuleMatch, SecurityGroup,
    SecurityRule,
};
