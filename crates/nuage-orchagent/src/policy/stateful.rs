//! Stateful tracking of ICMP rules.
//!
//! The VSD only keeps state for request/reply ICMP types. A stateful group
//! rule on any other ICMP type (or with no type) is posted as a stateless
//! entry plus a reverse entry in the opposite direction.

use super::types::{EtherType, RuleMatch};

/// ICMPv4 types the VSD tracks statefully: echo, timestamp, information and
/// address mask requests.
pub const STATEFUL_ICMP_V4_TYPES: [u32; 4] = [8, 13, 15, 17];
/// ICMPv6 echo request.
pub const STATEFUL_ICMP_V6_TYPES: [u32; 1] = [128];

pub fn stateful_icmp_types(ether_type: EtherType) -> &'static [u32] {
    match ether_type {
        EtherType::IPv4 => &STATEFUL_ICMP_V4_TYPES,
        EtherType::IPv6 => &STATEFUL_ICMP_V6_TYPES,
    }
}

/// Whether the VSD can track an ICMP rule with this type.
pub fn icmp_trackable(ether_type: EtherType, icmp_type: Option<u32>) -> bool {
    icmp_type.is_some_and(|t| stateful_icmp_types(ether_type).contains(&t))
}

/// Whether a rule of a group with the given statefulness needs a reverse
/// entry.
pub fn needs_reverse(rule: &RuleMatch, group_stateful: bool) -> bool {
    group_stateful && rule.protocol.is_icmp() && !icmp_trackable(rule.ether_type, rule.port_range_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{Direction, SecurityRule};

    fn icmp(ether_type: EtherType, icmp_type: Option<u32>, icmp_code: Option<u32>) -> RuleMatch {
        SecurityRule::new("r", "sg", Direction::Ingress)
            .with_ethertype(ether_type)
            .with_protocol("icmp")
            .with_ports(icmp_type, icmp_code)
            .normalize()
            .unwrap()
    }

    #[test]
    fn test_echo_request_is_tracked() {
        assert!(!needs_reverse(&icmp(EtherType::IPv4, Some(8), Some(0)), true));
        assert!(!needs_reverse(&icmp(EtherType::IPv6, Some(128), None), true));
    }

    #[test]
    fn test_untracked_icmp_needs_reverse() {
        assert!(needs_reverse(&icmp(EtherType::IPv4, None, None), true));
        assert!(needs_reverse(&icmp(EtherType::IPv4, Some(3), Some(1)), true));
        assert!(needs_reverse(&icmp(EtherType::IPv4, None, Some(4)), true));
        // Echo request numbers are per family.
        assert!(needs_reverse(&icmp(EtherType::IPv6, Some(8), None), true));
    }

    #[test]
    fn test_stateless_group_never_reverses() {
        assert!(!needs_reverse(&icmp(EtherType::IPv4, None, None), false));
    }

    #[test]
    fn test_non_icmp_never_reverses() {
        let tcp = SecurityRule::new("r", "sg", Direction::Egress)
            .with_protocol("tcp")
            .normalize()
            .unwrap();
        assert!(!needs_reverse(&tcp, true));
    }
}
