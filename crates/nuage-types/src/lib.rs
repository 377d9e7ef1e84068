//! Common value types for the Nuage VSD adapter.
//!
//! This crate provides type-safe representations of the network primitives
//! exchanged between the cloud networking API and the VSD:
//!
//! - [`IpVersion`]: the address family of a subnet or rule
//! - [`IpAddress`]: IPv4 and IPv6 addresses
//! - [`IpPrefix`]: IP network prefixes (CIDR notation)
//! - [`IpRange`]: inclusive address ranges, used for allocation pools
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses

mod ip;
mod mac;

pub use ip::{IpAddress, IpPrefix, IpRange, IpVersion, Ipv4Address, Ipv6Address};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid IP version: {0} (must be 4 or 6)")]
    InvalidIpVersion(u8),
}
