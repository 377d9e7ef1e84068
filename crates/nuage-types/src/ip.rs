//! IP address, prefix and range types with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a subnet, fixed IP or security rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Returns the numeric version (4 or 6).
    pub const fn as_u8(&self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Returns the other address family.
    pub const fn other(&self) -> IpVersion {
        match self {
            IpVersion::V4 => IpVersion::V6,
            IpVersion::V6 => IpVersion::V4,
        }
    }

    const fn bits(&self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(ParseError::InvalidIpVersion(other)),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(version: IpVersion) -> u8 {
        version.as_u8()
    }
}

/// An IPv4 address wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Ipv4Address(Ipv4Addr::UNSPECIFIED);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn inner(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

/// An IPv6 address wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv6Address(Ipv6Addr);

impl Ipv6Address {
    pub const UNSPECIFIED: Self = Ipv6Address(Ipv6Addr::UNSPECIFIED);

    pub const fn inner(&self) -> Ipv6Addr {
        self.0
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv6Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>()
            .map(Ipv6Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

/// An IP address that can be either IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Returns true if this is an IPv6 address.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    pub const fn version(&self) -> IpVersion {
        match self {
            IpAddress::V4(_) => IpVersion::V4,
            IpAddress::V6(_) => IpVersion::V6,
        }
    }

    /// Returns the address as an integer, widened to 128 bits.
    pub fn to_bits(&self) -> u128 {
        match self {
            IpAddress::V4(addr) => u128::from(u32::from(addr.0)),
            IpAddress::V6(addr) => u128::from(addr.0),
        }
    }

    /// Builds an address of the given family from its integer value.
    ///
    /// IPv4 values are truncated to their low 32 bits.
    pub fn from_bits(version: IpVersion, bits: u128) -> Self {
        match version {
            IpVersion::V4 => IpAddress::V4(Ipv4Address(Ipv4Addr::from(bits as u32))),
            IpVersion::V6 => IpAddress::V6(Ipv6Address(Ipv6Addr::from(bits))),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Address>().map(IpAddress::V6)
        } else {
            s.parse::<Ipv4Address>().map(IpAddress::V4)
        }
    }
}

impl TryFrom<String> for IpAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpAddress> for String {
    fn from(addr: IpAddress) -> String {
        addr.to_string()
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(Ipv4Address(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(Ipv6Address(addr))
    }
}

/// An inclusive range of addresses of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpRange {
    pub start: IpAddress,
    pub end: IpAddress,
}

impl IpRange {
    pub fn new(start: IpAddress, end: IpAddress) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: &IpAddress) -> bool {
        addr.version() == self.start.version()
            && self.start.to_bits() <= addr.to_bits()
            && addr.to_bits() <= self.end.to_bits()
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = address.version().bits();
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max_len
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// The match-any prefix for an address family (0.0.0.0/0 or ::/0).
    pub fn any(version: IpVersion) -> Self {
        IpPrefix {
            address: IpAddress::from_bits(version, 0),
            prefix_len: 0,
        }
    }

    /// Returns the address this prefix was written with.
    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn version(&self) -> IpVersion {
        self.address.version()
    }

    /// Returns true if this is an IPv4 prefix.
    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Returns true if this is an IPv6 prefix.
    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    fn host_bits(&self) -> u32 {
        u32::from(self.version().bits() - self.prefix_len)
    }

    fn mask_bits(&self) -> u128 {
        let total = u32::from(self.version().bits());
        let all = if total == 128 { u128::MAX } else { (1u128 << total) - 1 };
        match self.host_bits() {
            0 => all,
            h if h >= 128 => 0,
            h => all & !((1u128 << h) - 1),
        }
    }

    /// Returns the network (first) address of this prefix.
    pub fn network(&self) -> IpAddress {
        IpAddress::from_bits(self.version(), self.address.to_bits() & self.mask_bits())
    }

    /// Returns the last address of this prefix (the IPv4 broadcast address).
    pub fn last(&self) -> IpAddress {
        IpAddress::from_bits(self.version(), self.address.to_bits() | !self.mask_bits())
    }

    /// Returns the dotted netmask, e.g. `255.255.255.0` for a /24.
    pub fn netmask(&self) -> IpAddress {
        IpAddress::from_bits(self.version(), self.mask_bits())
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: &IpAddress) -> bool {
        addr.version() == self.version()
            && addr.to_bits() & self.mask_bits() == self.network().to_bits()
    }

    /// Generates the default allocation pools of a subnet.
    ///
    /// The pools cover every host address of the prefix except the network
    /// address, the IPv4 broadcast address and `gateway`, split into
    /// contiguous ranges around the gateway.
    pub fn allocation_pools(&self, gateway: Option<&IpAddress>) -> Vec<IpRange> {
        let version = self.version();
        let first = self.network().to_bits();
        let last = self.last().to_bits();
        if first == last {
            let addr = IpAddress::from_bits(version, first);
            return vec![IpRange::new(addr, addr)];
        }

        let first_ip = first + 1;
        let last_ip = match version {
            IpVersion::V4 => last - 1,
            IpVersion::V6 => last,
        };
        if first_ip >= last_ip {
            return Vec::new();
        }

        let gateway = gateway
            .filter(|gw| gw.version() == version)
            .map(IpAddress::to_bits)
            .filter(|gw| (first_ip..=last_ip).contains(gw));

        let mut bounds = Vec::with_capacity(2);
        match gateway {
            Some(gw) => {
                if gw > first_ip {
                    bounds.push((first_ip, gw - 1));
                }
                if gw < last_ip {
                    bounds.push((gw + 1, last_ip));
                }
            }
            None => bounds.push((first_ip, last_ip)),
        }

        bounds
            .into_iter()
            .map(|(start, end)| {
                IpRange::new(
                    IpAddress::from_bits(version, start),
                    IpAddress::from_bits(version, end),
                )
            })
            .collect()
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddress = addr_str.parse()?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_ip_address_discrimination() {
        let v4 = ip("10.0.0.1");
        assert!(v4.is_ipv4());
        assert_eq!(v4.version(), IpVersion::V4);

        let v6 = ip("::1");
        assert!(v6.is_ipv6());
        assert_eq!(v6.version(), IpVersion::V6);
    }

    #[test]
    fn test_ip_version_conversion() {
        assert_eq!(IpVersion::try_from(4).unwrap(), IpVersion::V4);
        assert_eq!(IpVersion::try_from(6).unwrap(), IpVersion::V6);
        assert!(IpVersion::try_from(5).is_err());
        assert_eq!(IpVersion::V4.other(), IpVersion::V6);
    }

    #[test]
    fn test_ip_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6_prefix.is_ipv6());
        assert_eq!(v6_prefix.prefix_len(), 32);
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_network_and_netmask() {
        let prefix: IpPrefix = "10.1.2.3/24".parse().unwrap();
        assert_eq!(prefix.network(), ip("10.1.2.0"));
        assert_eq!(prefix.netmask(), ip("255.255.255.0"));
        assert_eq!(prefix.last(), ip("10.1.2.255"));
        assert!(prefix.contains(&ip("10.1.2.200")));
        assert!(!prefix.contains(&ip("10.1.3.1")));
        assert!(!prefix.contains(&ip("::1")));
    }

    #[test]
    fn test_any_prefix() {
        assert_eq!(IpPrefix::any(IpVersion::V4).to_string(), "0.0.0.0/0");
        assert_eq!(IpPrefix::any(IpVersion::V6).to_string(), "::/0");
        assert!(IpPrefix::any(IpVersion::V6).is_default());
    }

    #[test]
    fn test_allocation_pools_v4_gateway_first() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let pools = prefix.allocation_pools(Some(&ip("10.0.0.1")));
        assert_eq!(pools, vec![IpRange::new(ip("10.0.0.2"), ip("10.0.0.254"))]);
    }

    #[test]
    fn test_allocation_pools_v4_gateway_in_middle() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let pools = prefix.allocation_pools(Some(&ip("10.0.0.100")));
        assert_eq!(
            pools,
            vec![
                IpRange::new(ip("10.0.0.1"), ip("10.0.0.99")),
                IpRange::new(ip("10.0.0.101"), ip("10.0.0.254")),
            ]
        );
    }

    #[test]
    fn test_allocation_pools_without_gateway() {
        let prefix: IpPrefix = "192.168.1.0/30".parse().unwrap();
        let pools = prefix.allocation_pools(None);
        assert_eq!(pools, vec![IpRange::new(ip("192.168.1.1"), ip("192.168.1.2"))]);
    }

    #[test]
    fn test_allocation_pools_v6_keeps_last_address() {
        let prefix: IpPrefix = "2001:db8::/126".parse().unwrap();
        let pools = prefix.allocation_pools(Some(&ip("2001:db8::1")));
        assert_eq!(pools, vec![IpRange::new(ip("2001:db8::2"), ip("2001:db8::3"))]);
    }

    #[test]
    fn test_allocation_pools_host_prefix() {
        let prefix: IpPrefix = "10.0.0.5/32".parse().unwrap();
        let pools = prefix.allocation_pools(None);
        assert_eq!(pools, vec![IpRange::new(ip("10.0.0.5"), ip("10.0.0.5"))]);
    }

    #[test]
    fn test_range_contains() {
        let range = IpRange::new(ip("10.0.0.1"), ip("10.0.0.9"));
        assert!(range.contains(&ip("10.0.0.5")));
        assert!(!range.contains(&ip("10.0.0.10")));
        assert_eq!(range.to_string(), "10.0.0.1-10.0.0.9");
    }
}
