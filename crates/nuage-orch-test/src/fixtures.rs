//! Seeded VSD topologies for common test scenarios
//!
//! Each builder writes directly into a [`FakeVsd`] and returns the ids it
//! created, so tests can start from an enterprise with an L2 domain or an
//! L3 domain/zone/subnet without issuing REST calls.

use crate::FakeVsd;
use nuage_vsd::Resource;
use serde_json::json;

/// CMS id used by fixtures when building external ids.
pub const CMS_ID: &str = "cms-test";

/// Options for a seeded L2 domain.
#[derive(Debug, Clone)]
pub struct L2DomainOptions {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub gateway: Option<String>,
    pub dhcp_managed: bool,
    pub ipv6_address: Option<String>,
    pub ipv6_gateway: Option<String>,
    /// Create ingress and egress ACL templates.
    pub acl_templates: bool,
    /// Create an ingress advanced forwarding template.
    pub adv_fwd_template: bool,
}

impl Default for L2DomainOptions {
    fn default() -> Self {
        Self {
            name: "l2-10-0-0-0".to_string(),
            address: "10.0.0.0".to_string(),
            netmask: "255.255.255.0".to_string(),
            gateway: Some("10.0.0.1".to_string()),
            dhcp_managed: true,
            ipv6_address: None,
            ipv6_gateway: None,
            acl_templates: true,
            adv_fwd_template: true,
        }
    }
}

impl L2DomainOptions {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unmanaged(mut self) -> Self {
        self.dhcp_managed = false;
        self.gateway = None;
        self
    }

    pub fn without_templates(mut self) -> Self {
        self.acl_templates = false;
        self.adv_fwd_template = false;
        self
    }

    pub fn with_ipv6(mut self, cidr: impl Into<String>, gateway: impl Into<String>) -> Self {
        self.ipv6_address = Some(cidr.into());
        self.ipv6_gateway = Some(gateway.into());
        self
    }
}

/// Ids of a seeded L2 domain.
#[derive(Debug, Clone, Default)]
pub struct L2Fixture {
    pub enterprise: String,
    pub l2domain: String,
    pub ingress_acl: Option<String>,
    pub egress_acl: Option<String>,
    pub adv_fwd: Option<String>,
}

/// Ids of a seeded L3 domain with one zone and one subnet.
#[derive(Debug, Clone, Default)]
pub struct L3Fixture {
    pub enterprise: String,
    pub domain: String,
    pub zone: String,
    pub subnet: String,
    pub ingress_acl: Option<String>,
    pub egress_acl: Option<String>,
    pub adv_fwd: Option<String>,
}

/// Seeds an enterprise.
pub fn seed_enterprise(vsd: &FakeVsd, name: &str) -> String {
    vsd.insert(Resource::Enterprise, None, json!({ "name": name }))
}

/// Seeds a user group in `enterprise`.
pub fn seed_group(vsd: &FakeVsd, enterprise: &str, name: &str) -> String {
    vsd.insert(
        Resource::Group,
        Some((Resource::Enterprise, enterprise)),
        json!({ "name": name }),
    )
}

/// Seeds an L2 domain and its policy templates in `enterprise`.
pub fn seed_l2domain(vsd: &FakeVsd, enterprise: &str, options: L2DomainOptions) -> L2Fixture {
    let l2domain = vsd.insert(
        Resource::L2Domain,
        Some((Resource::Enterprise, enterprise)),
        json!({
            "name": options.name,
            "address": options.address,
            "netmask": options.netmask,
            "gateway": options.gateway,
            "DHCPManaged": options.dhcp_managed,
            "IPType": if options.ipv6_address.is_some() { "DUALSTACK" } else { "IPV4" },
            "IPv6Address": options.ipv6_address,
            "IPv6Gateway": options.ipv6_gateway,
        }),
    );
    let (ingress_acl, egress_acl, adv_fwd) = seed_templates(
        vsd,
        Resource::L2Domain,
        &l2domain,
        options.acl_templates,
        options.adv_fwd_template,
    );
    L2Fixture {
        enterprise: enterprise.to_string(),
        l2domain,
        ingress_acl,
        egress_acl,
        adv_fwd,
    }
}

/// Seeds an L3 domain, a zone and a `10.1.0.0/24` subnet in `enterprise`.
pub fn seed_l3(vsd: &FakeVsd, enterprise: &str, templates: bool) -> L3Fixture {
    let domain = vsd.insert(
        Resource::Domain,
        Some((Resource::Enterprise, enterprise)),
        json!({ "name": "router-domain" }),
    );
    let zone = vsd.insert(
        Resource::Zone,
        Some((Resource::Domain, domain.as_str())),
        json!({ "name": "def_zone" }),
    );
    let subnet = vsd.insert(
        Resource::Subnet,
        Some((Resource::Zone, zone.as_str())),
        json!({
            "name": "l3-10-1-0-0",
            "address": "10.1.0.0",
            "netmask": "255.255.255.0",
            "gateway": "10.1.0.1",
            "IPType": "IPV4",
        }),
    );
    let (ingress_acl, egress_acl, adv_fwd) =
        seed_templates(vsd, Resource::Domain, &domain, templates, templates);
    L3Fixture {
        enterprise: enterprise.to_string(),
        domain,
        zone,
        subnet,
        ingress_acl,
        egress_acl,
        adv_fwd,
    }
}

fn seed_templates(
    vsd: &FakeVsd,
    parent: Resource,
    parent_id: &str,
    acl: bool,
    adv_fwd: bool,
) -> (Option<String>, Option<String>, Option<String>) {
    let mut ingress = None;
    let mut egress = None;
    if acl {
        ingress = Some(vsd.insert(
            Resource::IngressAclTemplate,
            Some((parent, parent_id)),
            json!({ "name": "default-ingress", "priority": 100 }),
        ));
        egress = Some(vsd.insert(
            Resource::EgressAclTemplate,
            Some((parent, parent_id)),
            json!({ "name": "default-egress", "priority": 100 }),
        ));
    }
    let fwd = adv_fwd.then(|| {
        vsd.insert(
            Resource::IngressAdvFwdTemplate,
            Some((parent, parent_id)),
            json!({ "name": "default-fwd" }),
        )
    });
    (ingress, egress, fwd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_seed_l2domain_with_templates() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let l2 = seed_l2domain(&vsd, &ent, L2DomainOptions::default());
        assert!(l2.ingress_acl.is_some());
        assert!(l2.adv_fwd.is_some());
        assert_eq!(vsd.children(&l2.l2domain, Resource::EgressAclTemplate).len(), 1);
        let domain = vsd.object(&l2.l2domain).unwrap();
        assert_eq!(domain.parent_id(), Some(ent.as_str()));
        assert_eq!(domain.bool("DHCPManaged"), Some(true));
    }

    #[test]
    fn test_seed_l3_chain() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let l3 = seed_l3(&vsd, &ent, false);
        assert!(l3.egress_acl.is_none());
        let subnet = vsd.object(&l3.subnet).unwrap();
        assert_eq!(subnet.parent_id(), Some(l3.zone.as_str()));
        let zone = vsd.object(&l3.zone).unwrap();
        assert_eq!(zone.parent_id(), Some(l3.domain.as_str()));
    }
}
