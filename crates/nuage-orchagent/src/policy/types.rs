//! Security group vocabulary and the VSD ACL entry it is translated into.

use crate::error::{OrchError, OrchResult};
use nuage_types::{IpPrefix, IpVersion};
use nuage_vsd::Resource;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// IP protocol numbers of ICMP and ICMPv6.
pub const ICMP_PROTOCOLS: [u8; 2] = [1, 58];
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Name of the policy group attached to vports without port security.
pub const ALLOW_ALL_POLICY_GROUP: &str = "PG_FOR_LESS_SECURITY";

/// Protocol names accepted in rules, with their IP protocol numbers.
const IP_PROTOCOL_MAP: [(&str, u8); 23] = [
    ("ah", 51),
    ("dccp", 33),
    ("egp", 8),
    ("esp", 50),
    ("gre", 47),
    ("icmp", 1),
    ("icmpv6", 58),
    ("igmp", 2),
    ("ipip", 4),
    ("ipv6-encap", 41),
    ("ipv6-frag", 44),
    ("ipv6-icmp", 58),
    ("ipv6-nonxt", 59),
    ("ipv6-opts", 60),
    ("ipv6-route", 43),
    ("ospf", 89),
    ("pgm", 113),
    ("rsvp", 46),
    ("sctp", 132),
    ("tcp", 6),
    ("udp", 17),
    ("udplite", 136),
    ("vrrp", 112),
];

/// Direction of a security group rule, as seen from the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Ingress => Direction::Egress,
            Direction::Egress => Direction::Ingress,
        }
    }

    /// The VSD template a rule of this direction is posted to. The VSD
    /// names templates from the domain's point of view, so the port's
    /// ingress is the domain's egress.
    pub fn acl_direction(&self) -> AclDirection {
        match self {
            Direction::Ingress => AclDirection::Egress,
            Direction::Egress => AclDirection::Ingress,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

impl FromStr for Direction {
    type Err = OrchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingress" => Ok(Direction::Ingress),
            "egress" => Ok(Direction::Egress),
            _ => Err(OrchError::validation(format!("Unknown direction {}", s))),
        }
    }
}

/// Direction of a VSD ACL template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclDirection {
    Ingress,
    Egress,
}

impl AclDirection {
    pub const fn template_resource(&self) -> Resource {
        match self {
            AclDirection::Ingress => Resource::IngressAclTemplate,
            AclDirection::Egress => Resource::EgressAclTemplate,
        }
    }

    pub const fn entry_resource(&self) -> Resource {
        match self {
            AclDirection::Ingress => Resource::IngressAclEntry,
            AclDirection::Egress => Resource::EgressAclEntry,
        }
    }

    /// Inverse of [`Direction::acl_direction`].
    pub fn rule_direction(&self) -> Direction {
        match self {
            AclDirection::Ingress => Direction::Egress,
            AclDirection::Egress => Direction::Ingress,
        }
    }

    /// The template named like `direction`, without inversion.
    pub fn same_as(direction: Direction) -> Self {
        match direction {
            Direction::Ingress => AclDirection::Ingress,
            Direction::Egress => AclDirection::Egress,
        }
    }

    /// `/<templates>/<id>/<entries>`
    pub fn entries_path(&self, template_id: &str) -> String {
        self.template_resource()
            .child_path(template_id, self.entry_resource())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtherType {
    IPv4,
    IPv6,
}

impl EtherType {
    /// Value of the VSD `etherType` attribute.
    pub const fn hex(&self) -> &'static str {
        match self {
            EtherType::IPv4 => "0x0800",
            EtherType::IPv6 => "0x86DD",
        }
    }

    pub const fn ip_version(&self) -> IpVersion {
        match self {
            EtherType::IPv4 => IpVersion::V4,
            EtherType::IPv6 => IpVersion::V6,
        }
    }

    pub const ALL: [EtherType; 2] = [EtherType::IPv4, EtherType::IPv6];
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::IPv4 => write!(f, "IPv4"),
            EtherType::IPv6 => write!(f, "IPv6"),
        }
    }
}

impl FromStr for EtherType {
    type Err = OrchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IPv4" => Ok(EtherType::IPv4),
            "IPv6" => Ok(EtherType::IPv6),
            other => Err(OrchError::validation(format!(
                "Unsupported ACL attribute: ethertype {}",
                other
            ))),
        }
    }
}

/// Protocol of a rule as the caller wrote it: a name or a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProtocolSpec {
    Number(u8),
    Name(String),
}

impl ProtocolSpec {
    /// Resolves names and numeric strings. ICMP under IPv6 is ICMPv6.
    pub fn normalize(&self, ether_type: EtherType) -> OrchResult<Protocol> {
        match self {
            ProtocolSpec::Number(n) => Ok(Protocol::Number(*n)),
            ProtocolSpec::Name(name) => {
                if name.eq_ignore_ascii_case("any") {
                    return Ok(Protocol::Any);
                }
                if let Ok(n) = name.parse::<u8>() {
                    return Ok(Protocol::Number(n));
                }
                let lookup = match (name.as_str(), ether_type) {
                    ("icmp", EtherType::IPv6) => "ipv6-icmp",
                    (other, _) => other,
                };
                IP_PROTOCOL_MAP
                    .iter()
                    .find(|(n, _)| *n == lookup)
                    .map(|(_, num)| Protocol::Number(*num))
                    .ok_or_else(|| OrchError::validation(format!("Unsupported protocol {}", name)))
            }
        }
    }
}

impl From<&str> for ProtocolSpec {
    fn from(name: &str) -> Self {
        ProtocolSpec::Name(name.to_string())
    }
}

impl From<u8> for ProtocolSpec {
    fn from(number: u8) -> Self {
        ProtocolSpec::Number(number)
    }
}

/// Normalized protocol of an ACL entry. Serializes as `"ANY"` or the
/// protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Any,
    Number(u8),
}

impl Protocol {
    pub fn is_tcp_or_udp(&self) -> bool {
        matches!(self, Protocol::Number(PROTO_TCP | PROTO_UDP))
    }

    pub fn is_icmp(&self) -> bool {
        matches!(self, Protocol::Number(n) if ICMP_PROTOCOLS.contains(n))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Any => write!(f, "ANY"),
            Protocol::Number(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Protocol::Any => serializer.serialize_str("ANY"),
            Protocol::Number(n) => serializer.serialize_u8(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ProtocolSpec::deserialize(deserializer)? {
            ProtocolSpec::Number(n) => Ok(Protocol::Number(n)),
            ProtocolSpec::Name(name) if name.eq_ignore_ascii_case("any") => Ok(Protocol::Any),
            ProtocolSpec::Name(name) => name
                .parse::<u8>()
                .map(Protocol::Number)
                .map_err(|_| serde::de::Error::custom(format!("invalid protocol {}", name))),
        }
    }
}

/// Flavor of policy group. Hardware groups back baremetal ports and get no
/// stateful tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyGroupKind {
    #[default]
    Software,
    Hardware,
    Interconnect,
}

impl PolicyGroupKind {
    /// Prefix of the `externalID` of groups and rules of this kind.
    pub const fn prefix(&self) -> &'static str {
        match self {
            PolicyGroupKind::Software => "",
            PolicyGroupKind::Hardware => "hw:",
            PolicyGroupKind::Interconnect => "ic:",
        }
    }

    /// Value of the VSD `type` attribute.
    pub const fn vsd_type(&self) -> &'static str {
        match self {
            PolicyGroupKind::Software => "SOFTWARE",
            PolicyGroupKind::Hardware => "HARDWARE",
            PolicyGroupKind::Interconnect => "INTERCONNECT",
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, PolicyGroupKind::Hardware)
    }

    pub fn external_id(&self, id: &str, cms_id: &str) -> String {
        crate::vsd::external_id(&format!("{}{}", self.prefix(), id), cms_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

fn default_ethertype() -> String {
    EtherType::IPv4.to_string()
}

/// A security group rule as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub security_group_id: String,
    pub direction: Direction,
    #[serde(default = "default_ethertype")]
    pub ethertype: String,
    #[serde(default)]
    pub protocol: Option<ProtocolSpec>,
    #[serde(default)]
    pub port_range_min: Option<u32>,
    #[serde(default)]
    pub port_range_max: Option<u32>,
    #[serde(default)]
    pub remote_ip_prefix: Option<IpPrefix>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
}

impl SecurityRule {
    pub fn new(id: impl Into<String>, security_group_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            security_group_id: security_group_id.into(),
            direction,
            ethertype: default_ethertype(),
            protocol: None,
            port_range_min: None,
            port_range_max: None,
            remote_ip_prefix: None,
            remote_group_id: None,
        }
    }

    pub fn with_ethertype(mut self, ether_type: EtherType) -> Self {
        self.ethertype = ether_type.to_string();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<ProtocolSpec>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_ports(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.port_range_min = min;
        self.port_range_max = max;
        self
    }

    pub fn with_remote_prefix(mut self, prefix: IpPrefix) -> Self {
        self.remote_ip_prefix = Some(prefix);
        self
    }

    pub fn with_remote_group(mut self, group_id: impl Into<String>) -> Self {
        self.remote_group_id = Some(group_id.into());
        self
    }

    pub fn ether_type(&self) -> OrchResult<EtherType> {
        self.ethertype.parse()
    }

    /// Checks the rule and resolves it into typed fields.
    pub fn normalize(&self) -> OrchResult<RuleMatch> {
        let ether_type = self.ether_type()?;
        let remote = match (&self.remote_ip_prefix, &self.remote_group_id) {
            (Some(_), Some(_)) => {
                return Err(OrchError::validation(
                    "Only remote_ip_prefix or remote_group_id may be provided.",
                ))
            }
            (Some(prefix), None) => {
                if prefix.version() != ether_type.ip_version() {
                    return Err(OrchError::validation(format!(
                        "Conflicting value ethertype {} for CIDR {}",
                        ether_type, prefix
                    )));
                }
                RemoteSpec::Prefix(*prefix)
            }
            (None, Some(group)) => RemoteSpec::Group(group.clone()),
            (None, None) => RemoteSpec::Unset,
        };
        let protocol = match &self.protocol {
            Some(spec) => spec.normalize(ether_type)?,
            None => Protocol::Any,
        };
        if self.port_range_min.is_some() || self.port_range_max.is_some() {
            if self.protocol.is_none() {
                return Err(OrchError::validation(
                    "protocol type required when port range is specified",
                ));
            }
            if protocol.is_tcp_or_udp() && self.port_range_min == Some(0) {
                return Err(OrchError::validation(
                    "Invalid port range, Port Number(0) must be between 1 and 65535",
                ));
            }
        }
        Ok(RuleMatch {
            direction: self.direction,
            ether_type,
            protocol,
            port_range_min: self.port_range_min,
            port_range_max: self.port_range_max,
            remote,
        })
    }
}

/// Remote side of a rule before it is resolved on the VSD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSpec {
    Unset,
    Prefix(IpPrefix),
    Group(String),
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub direction: Direction,
    pub ether_type: EtherType,
    pub protocol: Protocol,
    /// ICMP type for ICMP rules.
    pub port_range_min: Option<u32>,
    /// ICMP code for ICMP rules.
    pub port_range_max: Option<u32>,
    pub remote: RemoteSpec,
}

impl RuleMatch {
    /// The same match in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            direction: self.direction.opposite(),
            ..self.clone()
        }
    }

    /// Prefix matching every address of the rule's family.
    pub fn any_prefix(&self) -> IpPrefix {
        IpPrefix::any(self.ether_type.ip_version())
    }
}

/// `networkType` of an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    #[serde(rename = "ENDPOINT_DOMAIN")]
    EndpointDomain,
    #[serde(rename = "ANY")]
    Any,
    #[serde(rename = "ENTERPRISE_NETWORK")]
    EnterpriseNetwork,
    #[serde(rename = "POLICYGROUP")]
    PolicyGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AclAction {
    Forward,
    Drop,
}

/// Body of a VSD ingress or egress ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclEntry {
    pub ether_type: String,
    pub protocol: Protocol,
    pub network_type: NetworkType,
    #[serde(rename = "networkID", default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    pub location_type: String,
    #[serde(rename = "locationID", default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    pub action: AclAction,
    pub stateful: bool,
    #[serde(rename = "DSCP")]
    pub dscp: String,
    pub flow_logging_enabled: bool,
    pub stats_logging_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<String>,
    #[serde(rename = "ICMPType", default, skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<String>,
    #[serde(rename = "ICMPCode", default, skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<String>,
    #[serde(rename = "externalID", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl AclEntry {
    /// A forwarding entry for `location_id` matching any traffic.
    pub fn allow_any(ether_type: EtherType, location_id: &str) -> Self {
        Self {
            ether_type: ether_type.hex().to_string(),
            protocol: Protocol::Any,
            network_type: NetworkType::Any,
            network_id: None,
            location_type: "POLICYGROUP".to_string(),
            location_id: Some(location_id.to_string()),
            action: AclAction::Forward,
            stateful: false,
            dscp: "*".to_string(),
            flow_logging_enabled: false,
            stats_logging_enabled: false,
            source_port: None,
            destination_port: None,
            icmp_type: None,
            icmp_code: None,
            external_id: None,
        }
    }

    /// The explicit drop rule closing a hardware policy group.
    pub fn deny_all(location_id: &str) -> Self {
        Self {
            action: AclAction::Drop,
            ..Self::allow_any(EtherType::IPv4, location_id)
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}
