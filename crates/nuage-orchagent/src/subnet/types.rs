//! Local network and subnet records.

use nuage_types::{IpAddress, IpPrefix, IpRange, IpVersion};
use serde::{Deserialize, Serialize};

/// Address mode accepted for IPv6 subnets.
pub const DHCPV6_STATEFUL: &str = "dhcpv6-stateful";

/// A segment of a multi-segment network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub network_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    #[serde(rename = "router:external")]
    pub external: bool,
    pub shared: bool,
    #[serde(rename = "provider:network_type")]
    pub provider_network_type: Option<String>,
    pub segments: Vec<Segment>,
}

impl Network {
    /// Only VXLAN networks are backed by the VSD.
    pub fn is_vxlan(&self) -> bool {
        self.provider_network_type.as_deref() == Some("vxlan")
            || self.segments.iter().any(|s| s.network_type == "vxlan")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub destination: IpPrefix,
    pub nexthop: IpAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub cidr: IpPrefix,
    #[serde(default)]
    pub gateway_ip: Option<IpAddress>,
    #[serde(default = "default_true")]
    pub enable_dhcp: bool,
    #[serde(default)]
    pub allocation_pools: Vec<IpRange>,
    #[serde(default)]
    pub dns_nameservers: Vec<IpAddress>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
    #[serde(default)]
    pub ipv6_ra_mode: Option<String>,
    #[serde(default)]
    pub ipv6_address_mode: Option<String>,
    /// Net partition id or name.
    #[serde(default)]
    pub net_partition: Option<String>,
    /// VSD subnet or L2 domain to link to.
    #[serde(default)]
    pub nuagenet: Option<String>,
    #[serde(default)]
    pub underlay: Option<bool>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub vsd_managed: bool,
}

fn default_true() -> bool {
    true
}

impl Subnet {
    /// A DHCP-enabled subnet with default pools around `gateway`.
    pub fn new(id: impl Into<String>, network_id: impl Into<String>, cidr: IpPrefix, gateway: Option<IpAddress>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            network_id: network_id.into(),
            tenant_id: String::new(),
            cidr,
            gateway_ip: gateway,
            enable_dhcp: true,
            allocation_pools: cidr.allocation_pools(gateway.as_ref()),
            dns_nameservers: Vec::new(),
            host_routes: Vec::new(),
            ipv6_ra_mode: None,
            ipv6_address_mode: None,
            net_partition: None,
            nuagenet: None,
            underlay: None,
            shared: false,
            vsd_managed: false,
        }
    }

    pub fn ip_version(&self) -> IpVersion {
        self.cidr.version()
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip_version() == IpVersion::V4
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip_version() == IpVersion::V6
    }

    /// Linking to an existing VSD subnet needs both attributes.
    pub fn requests_vsd_managed(&self) -> bool {
        self.nuagenet.is_some() && self.net_partition.is_some()
    }

    /// Last address of the last allocation pool, where the DHCP port goes.
    pub fn last_pool_address(&self) -> Option<IpAddress> {
        self.allocation_pools.last().map(|p| p.end)
    }

    /// Replaces the gateway and regenerates the allocation pools around it.
    pub fn regenerate_pools(&mut self, gateway: Option<IpAddress>) {
        self.gateway_ip = gateway;
        self.allocation_pools = self.cidr.allocation_pools(gateway.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_network_vxlan_detection() {
        let mut net = Network {
            provider_network_type: Some("vxlan".into()),
            ..Default::default()
        };
        assert!(net.is_vxlan());
        net.provider_network_type = Some("vlan".into());
        assert!(!net.is_vxlan());
        net.segments.push(Segment {
            network_type: "vxlan".into(),
        });
        assert!(net.is_vxlan());
    }

    #[test]
    fn test_subnet_defaults_from_json() {
        let subnet: Subnet = serde_json::from_value(serde_json::json!({
            "id": "s-1",
            "network_id": "n-1",
            "cidr": "10.0.0.0/24",
            "gateway_ip": "10.0.0.1",
        }))
        .unwrap();
        assert!(subnet.enable_dhcp);
        assert!(subnet.is_ipv4());
        assert!(!subnet.requests_vsd_managed());
    }

    #[test]
    fn test_regenerate_pools() {
        let cidr: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let mut subnet = Subnet::new("s-1", "n-1", cidr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(subnet.last_pool_address(), Some("10.0.0.254".parse().unwrap()));

        subnet.regenerate_pools(Some("10.0.0.254".parse().unwrap()));
        assert_eq!(subnet.allocation_pools.len(), 1);
        assert_eq!(subnet.last_pool_address(), Some("10.0.0.253".parse().unwrap()));
    }
}
