//! The virtual endpoint: one host stack with interfaces and UDP bindings.

use crate::addr::{self, IpNet};
use crate::chunk::Chunk;
use crate::conn::{RECV_QUEUE_CAPACITY, UdpConn, UdpPacketConn};
use crate::error::{Error, Result};
use crate::interface::{HardwareAddr, Interface, InterfaceFlags};
use crate::native;
use crate::router::RouterInner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::sync::{Arc, Mutex, Weak};

pub(crate) const LO0: &str = "lo0";
pub(crate) const ETH0: &str = "eth0";

const LOOPBACK_MTU: u32 = 16384;
const ETHERNET_MTU: u32 = 1500;

/// Ephemeral range used when a caller binds port 0.
const EPHEMERAL_PORT_START: u16 = 5000;
const EPHEMERAL_PORT_END: u16 = 5999;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Addresses assigned to `eth0` at construction, as `"a.b.c.d"` or
    /// `"a.b.c.d/len"` strings.
    pub static_ips: Vec<String>,
}

/// A host stack. Constructed with a config it is fully virtual; constructed
/// with `None` it passes every operation through to the host OS.
#[derive(Clone)]
pub struct Net {
    v: Option<Arc<VNet>>,
}

impl Net {
    pub fn new(config: Option<NetConfig>) -> Result<Self> {
        match config {
            Some(config) => Ok(Self {
                v: Some(VNet::new(config)?),
            }),
            None => Ok(Self { v: None }),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.v.is_some()
    }

    pub fn interfaces(&self) -> Result<Vec<Interface>> {
        match &self.v {
            Some(v) => Ok(v.interfaces()),
            None => native::host_interfaces(),
        }
    }

    pub fn interface_by_name(&self, name: &str) -> Result<Interface> {
        self.interfaces()?
            .into_iter()
            .find(|ifc| ifc.name() == name)
            .ok_or_else(|| Error::NoSuchInterface(name.to_string()))
    }

    pub fn interface_by_index(&self, index: u32) -> Result<Interface> {
        self.interfaces()?
            .into_iter()
            .find(|ifc| ifc.index() == index)
            .ok_or_else(|| Error::NoSuchInterface(format!("index {}", index)))
    }

    /// Assign an additional address to one of this net's interfaces.
    pub fn add_interface_addr(&self, name: &str, addr: IpNet) -> Result<()> {
        match &self.v {
            Some(v) => v.add_interface_addr(name, addr),
            None => Err(Error::NativeMode),
        }
    }

    /// Open an unconnected UDP binding on `addr` (`"ip:port"`, port 0 for an
    /// ephemeral port).
    pub fn listen_packet(&self, network: &str, addr: &str) -> Result<Arc<dyn UdpPacketConn>> {
        check_network(network)?;
        match &self.v {
            Some(v) => {
                let local = addr::parse_sock_addr(addr)?;
                Ok(v.clone().bind(local, None)?)
            }
            None => native::listen_packet(addr),
        }
    }

    /// `listen_packet` with a structured local address.
    pub fn listen_udp(&self, network: &str, laddr: SocketAddr) -> Result<Arc<dyn UdpPacketConn>> {
        check_network(network)?;
        match &self.v {
            Some(v) => Ok(v.clone().bind(laddr, None)?),
            None => native::listen_packet(&laddr.to_string()),
        }
    }

    /// Open a connected UDP binding to `raddr` (`"host:port"`; non-literal
    /// hosts resolve through the parent router).
    pub fn dial(&self, network: &str, raddr: &str) -> Result<Arc<dyn UdpPacketConn>> {
        check_network(network)?;
        match &self.v {
            Some(v) => {
                let raddr = v.resolve_udp_addr(raddr)?;
                Ok(v.clone().dial(None, raddr)?)
            }
            None => native::dial(raddr),
        }
    }

    /// `dial` with structured addresses and an optional explicit local one.
    pub fn dial_udp(
        &self,
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: SocketAddr,
    ) -> Result<Arc<dyn UdpPacketConn>> {
        check_network(network)?;
        match &self.v {
            Some(v) => Ok(v.clone().dial(laddr, raddr)?),
            None => native::dial(&raddr.to_string()),
        }
    }

    /// Resolve a `host:port` string into a socket address, consulting the
    /// parent router's resolver for non-literal hosts.
    pub fn resolve_udp_addr(&self, network: &str, addr: &str) -> Result<SocketAddr> {
        check_network(network)?;
        match &self.v {
            Some(v) => v.resolve_udp_addr(addr),
            None => native::resolve_udp_addr(addr),
        }
    }

    pub(crate) fn vnet(&self) -> Option<&Arc<VNet>> {
        self.v.as_ref()
    }
}

pub(crate) fn check_network(network: &str) -> Result<()> {
    match network {
        "udp" | "udp4" => Ok(()),
        other => Err(Error::UnsupportedNetwork(other.to_string())),
    }
}

/// The virtual implementation behind [`Net`].
pub(crate) struct VNet {
    interfaces: Mutex<Vec<Interface>>,
    /// Authoritative registry of live bindings, keyed by the string form of
    /// the local address. Chunks without a matching entry are dropped.
    udp_conns: Mutex<HashMap<String, SyncSender<Chunk>>>,
    router: Mutex<Weak<RouterInner>>,
}

impl VNet {
    pub(crate) fn new(config: NetConfig) -> Result<Arc<Self>> {
        let mut lo0 = Interface::new(
            LO0,
            1,
            LOOPBACK_MTU,
            None,
            InterfaceFlags::UP | InterfaceFlags::LOOPBACK | InterfaceFlags::MULTICAST,
        );
        lo0.add_addr(IpNet::new(Ipv4Addr::LOCALHOST, 8)?);

        let mut eth0 = Interface::new(
            ETH0,
            2,
            ETHERNET_MTU,
            Some(HardwareAddr::generate()),
            InterfaceFlags::UP | InterfaceFlags::MULTICAST,
        );
        for s in &config.static_ips {
            let addr = if s.contains('/') {
                s.parse::<IpNet>()?
            } else {
                let ip: Ipv4Addr = s.parse().map_err(|_| Error::MalformedAddress(s.clone()))?;
                IpNet::new(ip, 32)?
            };
            eth0.add_addr(addr);
        }

        Ok(Arc::new(Self {
            interfaces: Mutex::new(vec![lo0, eth0]),
            udp_conns: Mutex::new(HashMap::new()),
            router: Mutex::new(Weak::new()),
        }))
    }

    pub(crate) fn interfaces(&self) -> Vec<Interface> {
        self.interfaces.lock().unwrap().clone()
    }

    pub(crate) fn add_interface_addr(&self, name: &str, addr: IpNet) -> Result<()> {
        let mut interfaces = self.interfaces.lock().unwrap();
        let ifc = interfaces
            .iter_mut()
            .find(|ifc| ifc.name() == name)
            .ok_or_else(|| Error::NoSuchInterface(name.to_string()))?;
        ifc.add_addr(addr);
        Ok(())
    }

    pub(crate) fn set_router(&self, router: Weak<RouterInner>) {
        *self.router.lock().unwrap() = router;
    }

    /// True iff `ip` is assigned to any interface on this net.
    pub(crate) fn has_ip_addr(&self, ip: IpAddr) -> bool {
        self.interfaces
            .lock()
            .unwrap()
            .iter()
            .flat_map(|ifc| ifc.addrs().unwrap_or(&[]).iter())
            .any(|a| IpAddr::V4(a.addr()) == ip)
    }

    /// All assigned addresses in interface order, optionally including
    /// loopback ones.
    pub(crate) fn get_all_ip_addrs(&self, include_loopback: bool) -> Vec<IpAddr> {
        self.interfaces
            .lock()
            .unwrap()
            .iter()
            .flat_map(|ifc| ifc.addrs().unwrap_or(&[]).iter())
            .map(|a| IpAddr::V4(a.addr()))
            .filter(|ip| include_loopback || !ip.is_loopback())
            .collect()
    }

    /// First free port in `[start, end]` for `ip`, judged against the
    /// bindings registry.
    pub(crate) fn assign_port(&self, ip: IpAddr, start: u16, end: u16) -> Result<u16> {
        free_port_in(&self.udp_conns.lock().unwrap(), ip, start, end)
    }

    /// The source IP a datagram should carry, decided at egress time.
    pub(crate) fn determine_source_ip(&self, local: IpAddr, dst: IpAddr) -> Option<IpAddr> {
        if !local.is_unspecified() {
            return Some(local);
        }
        if dst.is_loopback() {
            return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        self.get_all_ip_addrs(false).into_iter().next()
    }

    /// Register a new binding. A zero port draws from the ephemeral range.
    pub(crate) fn bind(
        self: Arc<Self>,
        mut local: SocketAddr,
        remote: Option<SocketAddr>,
    ) -> Result<Arc<UdpConn>> {
        if !local.ip().is_unspecified() && !self.has_ip_addr(local.ip()) {
            return Err(Error::AddressUnavailable(local.ip()));
        }

        let (sender, receiver) = sync_channel(RECV_QUEUE_CAPACITY);
        {
            let mut conns = self.udp_conns.lock().unwrap();
            if local.port() == 0 {
                let port =
                    free_port_in(&conns, local.ip(), EPHEMERAL_PORT_START, EPHEMERAL_PORT_END)?;
                local.set_port(port);
            } else if conns.contains_key(&local.to_string()) {
                return Err(Error::AddressInUse(local));
            }
            conns.insert(local.to_string(), sender);
        }

        tracing::debug!(addr = %local, "udp binding registered");
        Ok(Arc::new(UdpConn::new(self, local, remote, receiver)))
    }

    /// Open a connected binding to `raddr`, selecting the source address when
    /// no explicit local address was given.
    pub(crate) fn dial(
        self: Arc<Self>,
        laddr: Option<SocketAddr>,
        raddr: SocketAddr,
    ) -> Result<Arc<UdpConn>> {
        let (ip, port) = match laddr {
            Some(a) => (a.ip(), a.port()),
            None => (addr::unspecified_of(raddr.ip()), 0),
        };
        let src_ip = self
            .determine_source_ip(ip, raddr.ip())
            .ok_or(Error::NoRoute(raddr.ip()))?;
        self.bind(SocketAddr::new(src_ip, port), Some(raddr))
    }

    pub(crate) fn resolve_udp_addr(&self, addr: &str) -> Result<SocketAddr> {
        let (host, port) = addr::split_host_port(addr)?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let router = self
            .router
            .lock()
            .unwrap()
            .upgrade()
            .ok_or_else(|| Error::UnknownHost(host.to_string()))?;
        let ip = router.resolver().lookup_host(host)?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Egress path shared by every binding on this net. Materializes the
    /// source IP, loops loopback traffic back locally and hands everything
    /// else to the parent router.
    pub(crate) fn write_chunk(
        &self,
        local: SocketAddr,
        dst: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        let src_ip = self
            .determine_source_ip(local.ip(), dst.ip())
            .ok_or(Error::NoRoute(dst.ip()))?;
        if payload.len() > self.egress_mtu(src_ip) as usize {
            return Err(Error::MessageTooLong);
        }

        let chunk = Chunk::new(SocketAddr::new(src_ip, local.port()), dst, payload.to_vec());
        tracing::trace!(chunk = %chunk, "egress");

        if dst.ip().is_loopback() {
            self.on_inbound_chunk(chunk);
            return Ok(());
        }
        match self.router.lock().unwrap().upgrade() {
            Some(router) => router.push(chunk),
            None => tracing::debug!(dst = %dst, "no upstream router, chunk dropped"),
        }
        Ok(())
    }

    /// Ingress entry point, called by the router (or by this net for
    /// loopback). Never blocks: unmatched destinations and full receive
    /// queues drop the chunk.
    pub(crate) fn on_inbound_chunk(&self, chunk: Chunk) {
        let dst = chunk.destination_addr();
        let sender = {
            let conns = self.udp_conns.lock().unwrap();
            match conns.get(&dst.to_string()) {
                Some(sender) => Some(sender.clone()),
                None => {
                    // wildcard binds are registered under the unspecified address
                    let fallback =
                        SocketAddr::new(addr::unspecified_of(dst.ip()), dst.port()).to_string();
                    conns.get(&fallback).cloned()
                }
            }
        };
        match sender {
            Some(sender) => {
                if sender.try_send(chunk).is_err() {
                    tracing::trace!(dst = %dst, "receive queue full, chunk dropped");
                }
            }
            None => tracing::trace!(dst = %dst, "no binding for destination, chunk dropped"),
        }
    }

    pub(crate) fn deregister(&self, addr: &SocketAddr) {
        self.udp_conns.lock().unwrap().remove(&addr.to_string());
    }

    pub(crate) fn binding_count(&self) -> usize {
        self.udp_conns.lock().unwrap().len()
    }

    fn egress_mtu(&self, src_ip: IpAddr) -> u32 {
        self.interfaces
            .lock()
            .unwrap()
            .iter()
            .find(|ifc| {
                ifc.addrs()
                    .unwrap_or(&[])
                    .iter()
                    .any(|a| IpAddr::V4(a.addr()) == src_ip)
            })
            .map(|ifc| ifc.mtu())
            .unwrap_or(ETHERNET_MTU)
    }
}

/// Exhaustive scan for a free `(ip, port)` over `[start, end]`.
fn free_port_in(
    conns: &HashMap<String, SyncSender<Chunk>>,
    ip: IpAddr,
    start: u16,
    end: u16,
) -> Result<u16> {
    if start > end {
        return Err(Error::InvalidPortRange(start, end));
    }
    for port in start..=end {
        if !conns.contains_key(&SocketAddr::new(ip, port).to_string()) {
            return Ok(port);
        }
    }
    Err(Error::NoFreePort)
}
