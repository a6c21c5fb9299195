//! Bound UDP endpoints.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::net::VNet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

/// Capacity of a single connection's receive queue, in chunks. Inbound
/// dispatch never blocks; chunks beyond this are dropped.
pub(crate) const RECV_QUEUE_CAPACITY: usize = 256;

/// The surface shared by virtual and native UDP endpoints.
pub trait UdpPacketConn: Send + Sync {
    /// Block until a datagram arrives or the connection is closed. Trailing
    /// bytes of a datagram larger than `buf` are discarded.
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send `buf` to `target`. Returns `buf.len()` on success; delivery is
    /// best-effort once the datagram enters the forwarding path.
    fn write_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;

    /// Send `buf` to the connected remote address.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    fn local_addr(&self) -> SocketAddr;

    /// The connected remote address; `None` for listen-style endpoints.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Idempotent. Deregisters the binding and wakes any blocked reader.
    fn close(&self) -> Result<()>;
}

/// A virtual UDP endpoint registered in its net's bindings table.
pub(crate) struct UdpConn {
    vnet: Arc<VNet>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    receiver: Mutex<Receiver<Chunk>>,
    closed: AtomicBool,
}

impl UdpConn {
    pub(crate) fn new(
        vnet: Arc<VNet>,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        receiver: Receiver<Chunk>,
    ) -> Self {
        Self {
            vnet,
            local_addr,
            remote_addr,
            receiver: Mutex::new(receiver),
            closed: AtomicBool::new(false),
        }
    }
}

impl UdpPacketConn for UdpConn {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        // Close drops the registered sender, which wakes this recv.
        let chunk = {
            let receiver = self.receiver.lock().unwrap();
            receiver.recv().map_err(|_| Error::Closed)?
        };
        let n = chunk.payload().len().min(buf.len());
        buf[..n].copy_from_slice(&chunk.payload()[..n]);
        Ok((n, chunk.source_addr()))
    }

    fn write_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.vnet.write_chunk(self.local_addr, target, buf)?;
        Ok(buf.len())
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let remote = self.remote_addr.ok_or(Error::NotConnected)?;
        self.write_to(buf, remote)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.vnet.deregister(&self.local_addr);
        tracing::debug!(addr = %self.local_addr, "connection closed");
        Ok(())
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
