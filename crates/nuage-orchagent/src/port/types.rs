//! Local port records and device-owner classes.

use nuage_types::{IpAddress, IpVersion, MacAddress};
use serde::{Deserialize, Serialize};

pub const DEVICE_OWNER_COMPUTE_PREFIX: &str = "compute:";
pub const DEVICE_OWNER_DHCP: &str = "network:dhcp";
/// Owner of the ports that reserve the VSD DHCP server address.
pub const DEVICE_OWNER_DHCP_NUAGE: &str = "network:dhcp:nuage";
pub const DEVICE_OWNER_LB_V2: &str = "neutron:LOADBALANCERV2";
pub const DEVICE_OWNER_IRONIC: &str = "compute:ironic";
pub const DEVICE_OWNER_TRUNK_SUBPORT: &str = "trunk:subport";
pub const DEVICE_OWNER_ROUTER_INTF: &str = "network:router_interface";
pub const DEVICE_OWNER_ROUTER_GW: &str = "network:router_gateway";
pub const DEVICE_OWNER_FLOATINGIP: &str = "network:floatingip";

pub const VNIC_NORMAL: &str = "normal";
pub const VNIC_BAREMETAL: &str = "baremetal";

/// VIF types of a port that may still change addresses.
pub const PORT_UNPLUGGED_TYPES: [&str; 3] = ["binding_failed", "unbound", "ovs"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: IpAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortBinding {
    pub host_id: Option<String>,
    pub vif_type: String,
    pub vnic_type: String,
}

impl Default for PortBinding {
    fn default() -> Self {
        Self {
            host_id: None,
            vif_type: "unbound".to_string(),
            vnic_type: VNIC_NORMAL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub mac_address: MacAddress,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub binding: PortBinding,
    #[serde(default = "default_true")]
    pub port_security_enabled: bool,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Port {
    pub fn new(id: impl Into<String>, network_id: impl Into<String>, mac_address: MacAddress) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            network_id: network_id.into(),
            tenant_id: String::new(),
            mac_address,
            fixed_ips: Vec::new(),
            device_owner: String::new(),
            device_id: String::new(),
            binding: PortBinding::default(),
            port_security_enabled: true,
            security_groups: Vec::new(),
        }
    }

    pub fn host_id(&self) -> Option<&str> {
        self.binding.host_id.as_deref().filter(|h| !h.is_empty())
    }

    pub fn is_host_bound(&self) -> bool {
        self.host_id().is_some()
    }

    pub fn is_dhcp(&self) -> bool {
        self.device_owner == DEVICE_OWNER_DHCP
    }

    /// Counts fixed IPs as (IPv4, IPv6).
    pub fn fixed_ips_per_version(&self) -> (usize, usize) {
        let v4 = self
            .fixed_ips
            .iter()
            .filter(|ip| ip.ip_address.version() == IpVersion::V4)
            .count();
        (v4, self.fixed_ips.len() - v4)
    }

    /// The fixed IP of one family, if any.
    pub fn ip_of(&self, version: IpVersion) -> Option<IpAddress> {
        self.fixed_ips
            .iter()
            .map(|ip| ip.ip_address)
            .find(|ip| ip.version() == version)
    }

    /// Whether the port's owner gets a vport at all.
    pub fn needs_vport(&self) -> bool {
        !matches!(
            self.device_owner.as_str(),
            DEVICE_OWNER_ROUTER_INTF | DEVICE_OWNER_ROUTER_GW | DEVICE_OWNER_FLOATINGIP
        )
    }

    /// Whether a host-bound port of this owner is backed by a VSD VM.
    pub fn should_have_vm(&self) -> bool {
        let owner = self.device_owner.as_str();
        if owner == DEVICE_OWNER_IRONIC || owner == DEVICE_OWNER_TRUNK_SUBPORT {
            return false;
        }
        owner.starts_with(DEVICE_OWNER_COMPUTE_PREFIX)
            || owner.contains(DEVICE_OWNER_LB_V2)
            || owner.contains(DEVICE_OWNER_DHCP)
    }

    /// LB and DHCP ports own a VM of their own, keyed by the port id.
    pub fn owns_private_vm(&self) -> bool {
        self.device_owner == DEVICE_OWNER_LB_V2 || self.device_owner == DEVICE_OWNER_DHCP
    }

    pub fn is_trunk_subport(&self) -> bool {
        self.device_owner == DEVICE_OWNER_TRUNK_SUBPORT
    }

    pub fn is_unplugged(&self) -> bool {
        PORT_UNPLUGGED_TYPES.contains(&self.binding.vif_type.as_str())
    }
}
