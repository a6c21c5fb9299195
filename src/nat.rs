//! 1:1 source-IP substitution for NATed network segments.

use crate::chunk::Chunk;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NatMode {
    /// No translation; the router forwards chunks as-is.
    #[default]
    None,
    /// Each attached net is paired with one mapped (outside) address drawn
    /// from the router's static IPs. Sources are rewritten on egress,
    /// destinations on ingress. Ports are preserved.
    OneToOne,
}

/// NAT behavior of a router. Endpoint-dependent and port-restricted modes are
/// not implemented.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NatType {
    pub mode: NatMode,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    mapped: Ipv4Addr,
    local: Ipv4Addr,
}

/// Address pairs for a `OneToOne` segment, filled in as nets attach.
#[derive(Debug, Default)]
pub(crate) struct OneToOneNat {
    mappings: Vec<Mapping>,
}

impl OneToOneNat {
    pub(crate) fn add_mapping(&mut self, mapped: Ipv4Addr, local: Ipv4Addr) {
        tracing::debug!(mapped = %mapped, local = %local, "1:1 NAT mapping added");
        self.mappings.push(Mapping { mapped, local });
    }

    pub(crate) fn is_mapped(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.mappings.iter().any(|m| m.mapped == v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Rewrite the source of an outbound chunk to its mapped address.
    pub(crate) fn translate_outbound(&self, chunk: &mut Chunk) {
        if let IpAddr::V4(src) = chunk.source_ip()
            && let Some(m) = self.mappings.iter().find(|m| m.local == src)
        {
            chunk.set_source_ip(IpAddr::V4(m.mapped));
        }
    }

    /// Rewrite the destination of an inbound chunk back to the inside
    /// address. Returns false when the destination is not mapped here.
    pub(crate) fn translate_inbound(&self, chunk: &mut Chunk) -> bool {
        if let IpAddr::V4(dst) = chunk.destination_ip()
            && let Some(m) = self.mappings.iter().find(|m| m.mapped == dst)
        {
            chunk.set_destination_ip(IpAddr::V4(m.local));
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn nat() -> OneToOneNat {
        let mut nat = OneToOneNat::default();
        nat.add_mapping("27.1.2.3".parse().unwrap(), "192.168.0.1".parse().unwrap());
        nat
    }

    #[test]
    fn test_outbound_source_rewrite() {
        let nat = nat();
        let mut chunk = Chunk::new(addr("192.168.0.1:5000"), addr("27.3.4.5:1234"), vec![]);
        nat.translate_outbound(&mut chunk);
        assert_eq!(chunk.source_addr().to_string(), "27.1.2.3:5000");

        // unmapped sources pass through untouched
        let mut other = Chunk::new(addr("192.168.0.9:5000"), addr("27.3.4.5:1234"), vec![]);
        nat.translate_outbound(&mut other);
        assert_eq!(other.source_addr().to_string(), "192.168.0.9:5000");
    }

    #[test]
    fn test_inbound_destination_rewrite() {
        let nat = nat();
        let mut chunk = Chunk::new(addr("27.3.4.5:1234"), addr("27.1.2.3:5000"), vec![]);
        assert!(nat.translate_inbound(&mut chunk));
        assert_eq!(chunk.destination_addr().to_string(), "192.168.0.1:5000");

        let mut other = Chunk::new(addr("27.3.4.5:1234"), addr("27.9.9.9:5000"), vec![]);
        assert!(!nat.translate_inbound(&mut other));
    }

    #[test]
    fn test_is_mapped() {
        let nat = nat();
        assert!(nat.is_mapped("27.1.2.3".parse().unwrap()));
        assert!(!nat.is_mapped("27.1.2.4".parse().unwrap()));
        assert!(!nat.is_mapped("::1".parse().unwrap()));
    }
}
