//! IPv4 addressing helpers: CIDR arithmetic and address-string parsing.

use crate::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// An IPv4 address with a prefix length, e.g. `1.2.3.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl IpNet {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::InvalidCidr(format!("{}/{}", addr, prefix_len)));
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_u32())
    }

    /// The network address (all host bits zero).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask_u32())
    }

    /// The broadcast address (all host bits one).
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !self.mask_u32())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => u32::from(v4) & self.mask_u32() == u32::from(self.network()),
            IpAddr::V6(_) => false,
        }
    }

    /// The `n`-th address counting from the network address, or `None` when
    /// `n` falls outside the prefix.
    pub fn nth(&self, n: u32) -> Option<Ipv4Addr> {
        let size = 1u64 << (32 - self.prefix_len);
        if u64::from(n) >= size {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network()) + n))
    }

    fn mask_u32(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }
}

impl FromStr for IpNet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidCidr(s.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidCidr(s.to_string()))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Split a `host:port` string. The host part may be a name or an IP literal.
pub(crate) fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::MalformedAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(Error::MalformedAddress(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::MalformedAddress(addr.to_string()))?;
    Ok((host, port))
}

/// Parse a `host:port` string whose host part must be an IP literal.
pub(crate) fn parse_sock_addr(addr: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(addr)?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::MalformedAddress(addr.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// The unspecified address of the same family as `ip`.
pub(crate) fn unspecified_of(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}
