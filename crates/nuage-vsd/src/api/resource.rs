//! VSD entity kinds and REST path construction.

use std::fmt;

/// A VSD entity kind.
///
/// Each kind has a plural REST name used in paths (`policygroups`) and a
/// singular entity name used in `parentType` attributes (`policygroup`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Enterprise,
    Domain,
    Zone,
    Subnet,
    L2Domain,
    L2DomainTemplate,
    PolicyGroup,
    IngressAclTemplate,
    EgressAclTemplate,
    IngressAclEntry,
    EgressAclEntry,
    IngressAdvFwdTemplate,
    IngressAdvFwdEntry,
    EnterpriseNetwork,
    Vport,
    Vm,
    VmInterface,
    SharedNetworkResource,
    RedirectionTarget,
    VirtualIp,
    Group,
    Permission,
}

impl Resource {
    const ALL: [Resource; 22] = [
        Resource::Enterprise,
        Resource::Domain,
        Resource::Zone,
        Resource::Subnet,
        Resource::L2Domain,
        Resource::L2DomainTemplate,
        Resource::PolicyGroup,
        Resource::IngressAclTemplate,
        Resource::EgressAclTemplate,
        Resource::IngressAclEntry,
        Resource::EgressAclEntry,
        Resource::IngressAdvFwdTemplate,
        Resource::IngressAdvFwdEntry,
        Resource::EnterpriseNetwork,
        Resource::Vport,
        Resource::Vm,
        Resource::VmInterface,
        Resource::SharedNetworkResource,
        Resource::RedirectionTarget,
        Resource::VirtualIp,
        Resource::Group,
        Resource::Permission,
    ];

    /// Singular entity name, as found in `parentType`.
    pub const fn entity_name(&self) -> &'static str {
        match self {
            Resource::Enterprise => "enterprise",
            Resource::Domain => "domain",
            Resource::Zone => "zone",
            Resource::Subnet => "subnet",
            Resource::L2Domain => "l2domain",
            Resource::L2DomainTemplate => "l2domaintemplate",
            Resource::PolicyGroup => "policygroup",
            Resource::IngressAclTemplate => "ingressacltemplate",
            Resource::EgressAclTemplate => "egressacltemplate",
            Resource::IngressAclEntry => "ingressaclentrytemplate",
            Resource::EgressAclEntry => "egressaclentrytemplate",
            Resource::IngressAdvFwdTemplate => "ingressadvfwdtemplate",
            Resource::IngressAdvFwdEntry => "ingressadvfwdentrytemplate",
            Resource::EnterpriseNetwork => "enterprisenetwork",
            Resource::Vport => "vport",
            Resource::Vm => "vm",
            Resource::VmInterface => "vminterface",
            Resource::SharedNetworkResource => "sharednetworkresource",
            Resource::RedirectionTarget => "redirectiontarget",
            Resource::VirtualIp => "virtualip",
            Resource::Group => "group",
            Resource::Permission => "permission",
        }
    }

    /// Plural REST name, as found in paths.
    pub fn rest_name(&self) -> String {
        format!("{}s", self.entity_name())
    }

    /// Looks a kind up by its singular entity name.
    pub fn from_entity_name(name: &str) -> Option<Resource> {
        Self::ALL.iter().copied().find(|r| r.entity_name() == name)
    }

    /// Looks a kind up by its plural REST name.
    pub fn from_rest_name(name: &str) -> Option<Resource> {
        name.strip_suffix('s').and_then(Self::from_entity_name)
    }

    /// `/<resources>`
    pub fn collection_path(&self) -> String {
        format!("/{}", self.rest_name())
    }

    /// `/<resources>/<id>`
    pub fn object_path(&self, id: &str) -> String {
        format!("/{}/{}", self.rest_name(), id)
    }

    /// `/<resources>/<id>/<children>`
    pub fn child_path(&self, id: &str, child: Resource) -> String {
        format!("/{}/{}/{}", self.rest_name(), id, child.rest_name())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entity_name())
    }
}
