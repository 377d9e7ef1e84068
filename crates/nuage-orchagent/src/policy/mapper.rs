//! Translation of a validated security group rule into a VSD ACL entry.
//!
//! The mapper is pure. Remote prefixes and groups are resolved to VSD ids
//! by the caller and passed in as a [`ResolvedRemote`]; priority and
//! `externalID` are set when the entry is posted.

use super::stateful::icmp_trackable;
use super::types::{AclAction, AclEntry, NetworkType, PolicyGroupKind, RuleMatch};

/// The VSD object the rule's remote side was resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRemote {
    /// No remote restriction beyond the entry's default network type.
    None,
    /// Network macro of a remote prefix.
    Macro(String),
    /// Policy group of a remote security group in the same parent.
    PolicyGroup(String),
    /// External policy group.
    External(String),
}

/// Where and how the entry will be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTarget {
    /// Policy group the entry is located on.
    pub location_id: String,
    pub kind: PolicyGroupKind,
    /// Statefulness of the owning security group.
    pub stateful: bool,
    /// False for L2 domains whose DHCP is not managed by the VSD.
    pub dhcp_managed: bool,
}

/// Renders a port range as the VSD expects it, `"80"` or `"80-90"`.
pub fn port_range(min: Option<u32>, max: Option<u32>) -> Option<String> {
    match (min, max) {
        (Some(min), Some(max)) if min == max => Some(min.to_string()),
        (Some(min), Some(max)) => Some(format!("{}-{}", min, max)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleMapper {
    flow_logging_enabled: bool,
    stats_logging_enabled: bool,
}

impl RuleMapper {
    pub fn new(flow_logging_enabled: bool, stats_logging_enabled: bool) -> Self {
        Self {
            flow_logging_enabled,
            stats_logging_enabled,
        }
    }

    pub fn map(&self, rule: &RuleMatch, target: &MappingTarget, remote: &ResolvedRemote) -> AclEntry {
        let hardware = target.kind.is_hardware();
        let mut entry = AclEntry {
            ether_type: rule.ether_type.hex().to_string(),
            protocol: rule.protocol,
            network_type: if hardware || !target.dhcp_managed {
                NetworkType::Any
            } else {
                NetworkType::EndpointDomain
            },
            network_id: None,
            location_type: "POLICYGROUP".to_string(),
            location_id: Some(target.location_id.clone()),
            action: AclAction::Forward,
            stateful: !hardware && target.stateful,
            dscp: "*".to_string(),
            flow_logging_enabled: self.flow_logging_enabled && !hardware,
            stats_logging_enabled: self.stats_logging_enabled && !hardware,
            source_port: None,
            destination_port: None,
            icmp_type: None,
            icmp_code: None,
            external_id: None,
        };

        if rule.protocol.is_tcp_or_udp() {
            entry.source_port = Some("*".to_string());
            entry.destination_port =
                Some(port_range(rule.port_range_min, rule.port_range_max).unwrap_or_else(|| "*".to_string()));
        } else if rule.protocol.is_icmp() {
            entry.icmp_type = rule.port_range_min.map(|t| t.to_string());
            entry.icmp_code = rule.port_range_max.map(|c| c.to_string());
            if !icmp_trackable(rule.ether_type, rule.port_range_min) {
                entry.stateful = false;
            }
        }

        match remote {
            ResolvedRemote::None => {}
            ResolvedRemote::Macro(id) => {
                entry.network_type = NetworkType::EnterpriseNetwork;
                entry.network_id = Some(id.clone());
            }
            // Hardware groups cannot reference other groups.
            ResolvedRemote::PolicyGroup(_) if hardware => {}
            ResolvedRemote::PolicyGroup(id) | ResolvedRemote::External(id) => {
                entry.network_type = NetworkType::PolicyGroup;
                entry.network_id = Some(id.clone());
            }
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{Direction, EtherType, Protocol, SecurityRule};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn target(kind: PolicyGroupKind) -> MappingTarget {
        MappingTarget {
            location_id: "pg-1".to_string(),
            kind,
            stateful: true,
            dhcp_managed: true,
        }
    }

    fn tcp(min: Option<u32>, max: Option<u32>) -> RuleMatch {
        SecurityRule::new("r", "sg", Direction::Ingress)
            .with_protocol("tcp")
            .with_ports(min, max)
            .normalize()
            .unwrap()
    }

    #[test]
    fn test_tcp_port_ranges() {
        let mapper = RuleMapper::default();
        let t = target(PolicyGroupKind::Software);
        let single = mapper.map(&tcp(Some(22), Some(22)), &t, &ResolvedRemote::None);
        assert_eq!(single.destination_port.as_deref(), Some("22"));
        assert_eq!(single.source_port.as_deref(), Some("*"));

        let range = mapper.map(&tcp(Some(1000), Some(2000)), &t, &ResolvedRemote::None);
        assert_eq!(range.destination_port.as_deref(), Some("1000-2000"));

        let open = mapper.map(&tcp(None, None), &t, &ResolvedRemote::None);
        assert_eq!(open.destination_port.as_deref(), Some("*"));
        assert_eq!(open.network_type, NetworkType::EndpointDomain);
        assert!(open.stateful);
    }

    #[test]
    fn test_body_attributes() {
        let mapper = RuleMapper::new(true, true);
        let entry = mapper.map(
            &tcp(Some(80), Some(80)),
            &target(PolicyGroupKind::Software),
            &ResolvedRemote::Macro("macro-1".into()),
        );
        let body = serde_json::to_value(&entry).unwrap();
        assert_eq!(body["etherType"], json!("0x0800"));
        assert_eq!(body["protocol"], json!(6));
        assert_eq!(body["networkType"], json!("ENTERPRISE_NETWORK"));
        assert_eq!(body["networkID"], json!("macro-1"));
        assert_eq!(body["locationType"], json!("POLICYGROUP"));
        assert_eq!(body["action"], json!("FORWARD"));
        assert_eq!(body["flowLoggingEnabled"], json!(true));
        assert_eq!(body["statsLoggingEnabled"], json!(true));
    }

    #[test]
    fn test_hardware_rules_are_plain() {
        let mapper = RuleMapper::new(true, true);
        let entry = mapper.map(
            &tcp(None, None),
            &target(PolicyGroupKind::Hardware),
            &ResolvedRemote::PolicyGroup("pg-2".into()),
        );
        assert!(!entry.stateful);
        assert!(!entry.flow_logging_enabled);
        assert!(!entry.stats_logging_enabled);
        assert_eq!(entry.network_type, NetworkType::Any);
        assert_eq!(entry.network_id, None);
    }

    #[test]
    fn test_unmanaged_l2domain_uses_any() {
        let mut t = target(PolicyGroupKind::Software);
        t.dhcp_managed = false;
        let entry = RuleMapper::default().map(&tcp(None, None), &t, &ResolvedRemote::None);
        assert_eq!(entry.network_type, NetworkType::Any);
    }

    #[test]
    fn test_remote_groups() {
        let mapper = RuleMapper::default();
        let t = target(PolicyGroupKind::Software);
        let entry = mapper.map(&tcp(None, None), &t, &ResolvedRemote::PolicyGroup("pg-2".into()));
        assert_eq!(entry.network_type, NetworkType::PolicyGroup);
        assert_eq!(entry.network_id.as_deref(), Some("pg-2"));

        let mut hw = target(PolicyGroupKind::Hardware);
        hw.stateful = false;
        let external = mapper.map(&tcp(None, None), &hw, &ResolvedRemote::External("ext-1".into()));
        assert_eq!(external.network_type, NetworkType::PolicyGroup);
    }

    #[test]
    fn test_icmp_statefulness() {
        let mapper = RuleMapper::default();
        let t = target(PolicyGroupKind::Software);
        let icmp = |ether_type, min, max| {
            SecurityRule::new("r", "sg", Direction::Egress)
                .with_ethertype(ether_type)
                .with_protocol("icmp")
                .with_ports(min, max)
                .normalize()
                .unwrap()
        };

        let echo = mapper.map(&icmp(EtherType::IPv4, Some(8), Some(0)), &t, &ResolvedRemote::None);
        assert!(echo.stateful);
        assert_eq!(echo.icmp_type.as_deref(), Some("8"));
        assert_eq!(echo.icmp_code.as_deref(), Some("0"));
        assert_eq!(echo.source_port, None);

        let unreachable = mapper.map(&icmp(EtherType::IPv4, Some(3), None), &t, &ResolvedRemote::None);
        assert!(!unreachable.stateful);
        assert_eq!(unreachable.icmp_code, None);

        let bare = mapper.map(&icmp(EtherType::IPv6, None, None), &t, &ResolvedRemote::None);
        assert!(!bare.stateful);
        assert_eq!(bare.protocol, Protocol::Number(58));
        assert_eq!(bare.ether_type, "0x86DD");
    }

    #[test]
    fn test_any_protocol_has_no_ports() {
        let rule = SecurityRule::new("r", "sg", Direction::Ingress).normalize().unwrap();
        let entry = RuleMapper::default().map(&rule, &target(PolicyGroupKind::Software), &ResolvedRemote::None);
        assert_eq!(entry.protocol, Protocol::Any);
        assert_eq!(entry.destination_port, None);
        assert_eq!(entry.icmp_type, None);
    }
}
