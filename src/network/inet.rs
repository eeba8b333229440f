use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Address family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Reachability classification of an IP address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpScope {
    /// Unspecified or otherwise unroutable
    None,

    /// Multicast group address
    Multicast,

    /// Loopback
    Loopback,

    /// Link-local (169.254/16, fe80::/10)
    LinkLocal,

    /// Carrier-grade shared space (100.64/10)
    Shared,

    /// Private space (RFC 1918, unique local)
    Private,

    /// Globally routable
    Global,
}

/// A transport endpoint: IP address and port
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InetAddress(SocketAddr);

impl InetAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn family(&self) -> AddressFamily {
        match self.0 {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Raw IP bytes: 4 for IPv4, 16 for IPv6
    pub fn raw_ip(&self) -> Vec<u8> {
        match self.0.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    /// Classify this endpoint's IP address
    pub fn scope(&self) -> IpScope {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                if ip.is_unspecified() || ip.is_broadcast() {
                    IpScope::None
                } else if ip.is_multicast() {
                    IpScope::Multicast
                } else if ip.is_loopback() {
                    IpScope::Loopback
                } else if ip.is_link_local() {
                    IpScope::LinkLocal
                } else if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
                    IpScope::Shared
                } else if ip.is_private() {
                    IpScope::Private
                } else {
                    IpScope::Global
                }
            }
            IpAddr::V6(ip) => {
                let segments = ip.segments();
                if ip.is_unspecified() {
                    IpScope::None
                } else if ip.is_multicast() {
                    IpScope::Multicast
                } else if ip.is_loopback() {
                    IpScope::Loopback
                } else if (segments[0] & 0xffc0) == 0xfe80 {
                    IpScope::LinkLocal
                } else if (segments[0] & 0xfe00) == 0xfc00 {
                    IpScope::Private
                } else {
                    IpScope::Global
                }
            }
        }
    }

    /// Wire form: family tag (4 or 6), raw IP bytes, big-endian port
    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self.family() {
            AddressFamily::Ipv4 => out.push(4),
            AddressFamily::Ipv6 => out.push(6),
        }
        out.extend_from_slice(&self.raw_ip());
        out.extend_from_slice(&self.port().to_be_bytes());
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({})", self.0)
    }
}
