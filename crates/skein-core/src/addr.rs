//! Network addressing.
//!
//! Addresses are plain value types. An [`Address`] is either empty
//! (unspecified/wildcard), a 4-byte IPv4 address, or a 16-byte IPv6
//! address; the empty form is how a wildcard bind or an unresolved local
//! address is expressed, and it is distinct from the all-zeros addresses.

use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Identifier of a network interface. `0` means "unspecified".
pub type NicId = u32;

/// A network-layer protocol an endpoint can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    /// IPv4 (RFC 791).
    Ipv4,
    /// IPv6 (RFC 8200).
    Ipv6,
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => f.write_str("IPv4"),
            Self::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// A network-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Address {
    /// No address; the wildcard in binds and the zero value elsewhere.
    #[default]
    Empty,
    /// A 4-byte IPv4 address.
    V4([u8; 4]),
    /// A 16-byte IPv6 address.
    V6([u8; 16]),
}

impl Address {
    /// The IPv4 limited broadcast address, 255.255.255.255.
    pub const V4_BROADCAST: Address = Address::V4([0xff; 4]);

    /// The IPv4 unspecified address, 0.0.0.0.
    pub const V4_ANY: Address = Address::V4([0; 4]);

    /// Address bytes in network order; empty for [`Address::Empty`].
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::V4(b) => b,
            Self::V6(b) => b,
        }
    }

    /// Length of the address in bytes (0, 4, or 16).
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether this is the empty (unspecified) address.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Whether this is a 4-byte address.
    pub fn is_v4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    /// Whether this is a 16-byte address.
    pub fn is_v6(&self) -> bool {
        matches!(self, Self::V6(_))
    }

    /// Whether the address is an IPv4 (224/4) or IPv6 (ff00::/8)
    /// multicast group address.
    pub fn is_multicast(&self) -> bool {
        match self {
            Self::V4(b) => b[0] & 0xf0 == 0xe0,
            Self::V6(b) => b[0] == 0xff,
            Self::Empty => false,
        }
    }

    /// Whether the address is the IPv4 limited broadcast address.
    pub fn is_limited_broadcast(&self) -> bool {
        *self == Self::V4_BROADCAST
    }

    /// Whether the address is an IPv4-mapped IPv6 address
    /// (`::ffff:a.b.c.d`).
    pub fn is_v4_mapped(&self) -> bool {
        match self {
            Self::V6(b) => b[..10] == [0; 10] && b[10] == 0xff && b[11] == 0xff,
            _ => false,
        }
    }

    /// The embedded IPv4 address of an IPv4-mapped IPv6 address.
    pub fn to_v4(&self) -> Option<Address> {
        match self {
            Self::V6(b) if self.is_v4_mapped() => {
                Some(Self::V4([b[12], b[13], b[14], b[15]]))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("*"),
            Self::V4(b) => Ipv4Addr::from(*b).fmt(f),
            Self::V6(b) => Ipv6Addr::from(*b).fmt(f),
        }
    }
}

impl From<[u8; 4]> for Address {
    fn from(octets: [u8; 4]) -> Self {
        Self::V4(octets)
    }
}

impl From<[u8; 16]> for Address {
    fn from(octets: [u8; 16]) -> Self {
        Self::V6(octets)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(a: Ipv4Addr) -> Self {
        Self::V4(a.octets())
    }
}

impl From<Ipv6Addr> for Address {
    fn from(a: Ipv6Addr) -> Self {
        Self::V6(a.octets())
    }
}

impl From<IpAddr> for Address {
    fn from(a: IpAddr) -> Self {
        match a {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

/// A full transport address: interface, network address, and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FullAddress {
    /// Interface the address is scoped to; `0` for any.
    pub nic: NicId,
    /// Network-layer address.
    pub addr: Address,
    /// Transport-layer port.
    pub port: u16,
}

impl FullAddress {
    /// Convenience constructor.
    pub fn new(nic: NicId, addr: Address, port: u16) -> Self {
        Self { nic, addr, port }
    }
}

impl fmt::Display for FullAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nic != 0 {
            write!(f, "{}%{}:{}", self.addr, self.nic, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Maps `addr` to its canonical form and determines the effective network
/// protocol for an operation on an endpoint of protocol `endpoint_proto`
/// whose registered local address is `bound_local`.
///
/// An IPv4-mapped IPv6 address becomes the embedded IPv4 address (the
/// mapped any-address becomes [`Address::Empty`]), and the effective
/// protocol becomes IPv4. A 4-byte target on an IPv6 endpoint is only
/// usable in dual-stack mode; with v6-only enabled it fails with
/// [`Error::NoRoute`]. A family mismatch against the already-bound local
/// address fails with [`Error::InvalidEndpointState`].
pub fn canonicalize(
    mut addr: FullAddress,
    endpoint_proto: NetworkProtocol,
    bound_local: &Address,
    v6_only: bool,
) -> Result<(FullAddress, NetworkProtocol)> {
    let mut net_proto = endpoint_proto;
    match addr.addr {
        Address::V4(_) => net_proto = NetworkProtocol::Ipv4,
        Address::V6(_) => {
            if let Some(v4) = addr.addr.to_v4() {
                net_proto = NetworkProtocol::Ipv4;
                addr.addr = if v4 == Address::V4_ANY { Address::Empty } else { v4 };
            }
        }
        Address::Empty => {}
    }

    // The family of an already-bound local address is binding.
    match bound_local {
        Address::V4(_) if addr.addr.is_v6() => return Err(Error::InvalidEndpointState),
        Address::V6(_) if addr.addr.is_v4() => return Err(Error::InvalidEndpointState),
        _ => {}
    }

    if net_proto == endpoint_proto {
        return Ok((addr, net_proto));
    }
    match (net_proto, endpoint_proto) {
        (NetworkProtocol::Ipv4, NetworkProtocol::Ipv6) if !v6_only => Ok((addr, net_proto)),
        (NetworkProtocol::Ipv4, NetworkProtocol::Ipv6) => Err(Error::NoRoute),
        _ => Err(Error::InvalidEndpointState),
    }
}
