//! Host-network passthrough: the same surface as the virtual stack, served by
//! the OS. Selected by constructing a [`crate::Net`] without a config.

use crate::addr::IpNet;
use crate::conn::UdpPacketConn;
use crate::error::{Error, Result};
use crate::interface::{Interface, InterfaceFlags};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// getifaddrs does not expose MTUs; report the conventional values.
const NATIVE_LOOPBACK_MTU: u32 = 65536;
const NATIVE_ETHERNET_MTU: u32 = 1500;

/// Enumerate the host's interfaces and their IPv4 addresses.
pub(crate) fn host_interfaces() -> Result<Vec<Interface>> {
    let ifaddrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;

    let mut interfaces: Vec<Interface> = Vec::new();
    for ifaddr in ifaddrs {
        let flags = convert_flags(ifaddr.flags);
        let pos = match interfaces
            .iter()
            .position(|ifc| ifc.name() == ifaddr.interface_name)
        {
            Some(pos) => pos,
            None => {
                let index =
                    nix::net::if_::if_nametoindex(ifaddr.interface_name.as_str()).unwrap_or(0);
                let mtu = if flags.contains(InterfaceFlags::LOOPBACK) {
                    NATIVE_LOOPBACK_MTU
                } else {
                    NATIVE_ETHERNET_MTU
                };
                interfaces.push(Interface::new(
                    ifaddr.interface_name.clone(),
                    index,
                    mtu,
                    None,
                    flags,
                ));
                interfaces.len() - 1
            }
        };
        let ifc = &mut interfaces[pos];

        if let Some(addr) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let prefix_len = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| u32::from(m.ip()).count_ones() as u8)
                .unwrap_or(32);
            ifc.add_addr(IpNet::new(addr.ip(), prefix_len)?);
        }
    }
    Ok(interfaces)
}

fn convert_flags(flags: nix::net::if_::InterfaceFlags) -> InterfaceFlags {
    use nix::net::if_::InterfaceFlags as Nix;

    let mut out = InterfaceFlags::default();
    for (nix_flag, flag) in [
        (Nix::IFF_UP, InterfaceFlags::UP),
        (Nix::IFF_LOOPBACK, InterfaceFlags::LOOPBACK),
        (Nix::IFF_MULTICAST, InterfaceFlags::MULTICAST),
        (Nix::IFF_BROADCAST, InterfaceFlags::BROADCAST),
        (Nix::IFF_POINTOPOINT, InterfaceFlags::POINT_TO_POINT),
    ] {
        if flags.contains(nix_flag) {
            out |= flag;
        }
    }
    out
}

/// A host UDP socket behind the shared conn surface.
///
/// `close` only marks the conn; a reader already blocked in the OS returns
/// once its current receive completes.
struct NativeUdpConn {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl UdpPacketConn for NativeUdpConn {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self.socket.recv_from(buf)?)
    }

    fn write_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self.socket.send_to(buf, target)?)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.remote_addr.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(self.socket.send(buf)?)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

pub(crate) fn listen_packet(addr: &str) -> Result<Arc<dyn UdpPacketConn>> {
    let socket = UdpSocket::bind(addr)?;
    let local_addr = socket.local_addr()?;
    Ok(Arc::new(NativeUdpConn {
        socket,
        local_addr,
        remote_addr: None,
        closed: AtomicBool::new(false),
    }))
}

pub(crate) fn dial(raddr: &str) -> Result<Arc<dyn UdpPacketConn>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(raddr)?;
    let local_addr = socket.local_addr()?;
    let remote_addr = socket.peer_addr()?;
    Ok(Arc::new(NativeUdpConn {
        socket,
        local_addr,
        remote_addr: Some(remote_addr),
        closed: AtomicBool::new(false),
    }))
}

pub(crate) fn resolve_udp_addr(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::MalformedAddress(addr.to_string()))
}
