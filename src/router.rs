//! A virtual network segment: owns a CIDR, attaches nets and child routers,
//! and forwards chunks between them.

use crate::addr::IpNet;
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::nat::{NatMode, NatType, OneToOneNat};
use crate::net::{ETH0, Net, VNet};
use crate::resolver::Resolver;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// Default capacity of the forwarding queue, in chunks.
const DEFAULT_QUEUE_SIZE: usize = 1024;

/// How often the forwarding worker re-checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// The segment's network, e.g. `"1.2.3.0/24"`. Required.
    pub cidr: String,
    /// Mapped (outside) addresses claimed by attached nets when 1:1 NAT is
    /// enabled.
    pub static_ips: Vec<String>,
    pub nat: NatType,
    /// Forwarding queue capacity; clamped to at least 1.
    pub max_queue_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Running,
    Stopped,
}

/// Handle to a network segment. Cloning shares the segment.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self> {
        if config.cidr.is_empty() {
            return Err(Error::MissingCidr);
        }
        let cidr: IpNet = config.cidr.parse()?;

        let mut static_ips = Vec::with_capacity(config.static_ips.len());
        for s in &config.static_ips {
            let ip: Ipv4Addr = s.parse().map_err(|_| Error::MalformedAddress(s.clone()))?;
            static_ips.push(ip);
        }

        let queue_size = config.max_queue_size.unwrap_or(DEFAULT_QUEUE_SIZE).max(1);
        let (queue_tx, queue_rx) = sync_channel(queue_size);

        Ok(Self {
            inner: Arc::new(RouterInner {
                cidr,
                resolver: Arc::new(Resolver::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(State::Fresh),
                worker: Mutex::new(None),
                children: Mutex::new(Vec::new()),
                child_routers: Mutex::new(Vec::new()),
                parent: Mutex::new(Weak::new()),
                next_host: Mutex::new(1),
                static_ips: Mutex::new(static_ips),
                nat_mode: config.nat.mode,
                nat: Mutex::new(OneToOneNat::default()),
            }),
        })
    }

    pub fn cidr(&self) -> IpNet {
        self.inner.cidr
    }

    /// Attach a virtual net: allocate it an address from the CIDR, write the
    /// address onto its `eth0` and link it back to this router.
    pub fn add_net(&self, net: &Net) -> Result<()> {
        let vnet = net.vnet().ok_or(Error::NativeMode)?;

        let ip = self.inner.allocate_ip()?;
        vnet.add_interface_addr(ETH0, IpNet::new(ip, self.inner.cidr.prefix_len())?)?;
        vnet.set_router(Arc::downgrade(&self.inner));

        if self.inner.nat_mode == NatMode::OneToOne {
            let mapped = {
                let mut pool = self.inner.static_ips.lock().unwrap();
                if pool.is_empty() {
                    return Err(Error::AddressSpaceExhausted("static IP pool".to_string()));
                }
                pool.remove(0)
            };
            self.inner.nat.lock().unwrap().add_mapping(mapped, ip);
        }

        self.inner.children.lock().unwrap().push(vnet.clone());
        tracing::debug!(cidr = %self.inner.cidr, ip = %ip, "net attached");
        Ok(())
    }

    /// Attach a child router (a LAN behind this segment). The child keeps its
    /// own forwarding worker and must be started separately.
    pub fn add_router(&self, child: &Router) -> Result<()> {
        *child.inner.parent.lock().unwrap() = Arc::downgrade(&self.inner);
        child
            .inner
            .resolver
            .set_parent(Arc::downgrade(&self.inner.resolver));
        self.inner.child_routers.lock().unwrap().push(child.inner.clone());
        tracing::debug!(cidr = %self.inner.cidr, child = %child.inner.cidr, "router attached");
        Ok(())
    }

    /// Register a hostname with this segment's resolver.
    pub fn add_host(&self, name: impl Into<String>, ip: IpAddr) {
        self.inner.resolver.add_host(name, ip);
    }

    /// Launch the forwarding worker. Fails on a router that is already
    /// running or was stopped.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            State::Fresh => {}
            State::Running => return Err(Error::RouterAlreadyStarted),
            State::Stopped => return Err(Error::RouterAlreadyStopped),
        }
        let Some(queue_rx) = self.inner.queue_rx.lock().unwrap().take() else {
            return Err(Error::RouterAlreadyStarted);
        };

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.clone();
        let handle = thread::Builder::new()
            .name(format!("vnet-router-{}", self.inner.cidr))
            .spawn(move || forward_loop(inner, queue_rx, shutdown))?;
        *self.inner.worker.lock().unwrap() = Some(handle);
        *state = State::Running;
        tracing::debug!(cidr = %self.inner.cidr, "router started");
        Ok(())
    }

    /// Stop the forwarding worker and join it. In-flight chunks are dropped.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != State::Running {
            return Err(Error::RouterAlreadyStopped);
        }
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        *state = State::Stopped;
        tracing::debug!(cidr = %self.inner.cidr, "router stopped");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push(&self, chunk: Chunk) {
        self.inner.push(chunk);
    }
}

pub(crate) struct RouterInner {
    cidr: IpNet,
    resolver: Arc<Resolver>,
    queue_tx: SyncSender<Chunk>,
    queue_rx: Mutex<Option<Receiver<Chunk>>>,
    shutdown: Arc<AtomicBool>,
    state: Mutex<State>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    children: Mutex<Vec<Arc<VNet>>>,
    child_routers: Mutex<Vec<Arc<RouterInner>>>,
    parent: Mutex<Weak<RouterInner>>,
    /// Offset of the next address handed to an attached net, counting from
    /// the network address. Starts at 1; the router shares `.1` with its
    /// first child.
    next_host: Mutex<u32>,
    /// Unclaimed mapped addresses for 1:1 NAT.
    static_ips: Mutex<Vec<Ipv4Addr>>,
    nat_mode: NatMode,
    nat: Mutex<OneToOneNat>,
}

impl RouterInner {
    /// Enqueue a chunk for forwarding. Never blocks; a full queue drops.
    pub(crate) fn push(&self, chunk: Chunk) {
        if self.queue_tx.try_send(chunk).is_err() {
            tracing::trace!(cidr = %self.cidr, "forwarding queue full, chunk dropped");
        }
    }

    pub(crate) fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    fn allocate_ip(&self) -> Result<Ipv4Addr> {
        let mut next = self.next_host.lock().unwrap();
        let candidate = self
            .cidr
            .nth(*next)
            .ok_or_else(|| Error::AddressSpaceExhausted(self.cidr.to_string()))?;
        if candidate == self.cidr.broadcast() {
            return Err(Error::AddressSpaceExhausted(self.cidr.to_string()));
        }
        *next += 1;
        Ok(candidate)
    }

    /// True when this segment is where `ip` lives: inside the CIDR or one of
    /// its NAT-mapped addresses.
    fn routes(&self, ip: IpAddr) -> bool {
        self.cidr.contains(ip) || self.nat.lock().unwrap().is_mapped(ip)
    }

    /// Forward one chunk. Failures here are silent drops, matching wire UDP.
    fn route(&self, mut chunk: Chunk) {
        tracing::trace!(cidr = %self.cidr, chunk = %chunk, "routing");

        // ingress to a NATed segment rewrites the destination first
        self.nat.lock().unwrap().translate_inbound(&mut chunk);

        // a child segment may own the destination
        let child_router = self
            .child_routers
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.routes(chunk.destination_ip()))
            .cloned();
        if let Some(child) = child_router {
            child.push(chunk);
            return;
        }

        let dst_ip = chunk.destination_ip();
        if self.cidr.contains(dst_ip) {
            let target = self
                .children
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.has_ip_addr(dst_ip))
                .cloned();
            match target {
                Some(child) => child.on_inbound_chunk(chunk),
                None => {
                    tracing::trace!(dst = %dst_ip, "no net owns the destination, chunk dropped");
                }
            }
            return;
        }

        // egress from a NATed segment rewrites the source
        self.nat.lock().unwrap().translate_outbound(&mut chunk);
        match self.parent.lock().unwrap().upgrade() {
            Some(parent) => parent.push(chunk),
            None => tracing::trace!(dst = %dst_ip, "unrouted chunk dropped"),
        }
    }
}

fn forward_loop(inner: Arc<RouterInner>, queue_rx: Receiver<Chunk>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match queue_rx.recv_timeout(SHUTDOWN_POLL) {
            Ok(chunk) => inner.route(chunk),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(cidr = %inner.cidr, "forwarding worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetConfig;
    use std::thread;

    fn virtual_net() -> Net {
        Net::new(Some(NetConfig::default())).unwrap()
    }

    // RUST_LOG=vnet=trace surfaces the forwarding decisions under test
    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn router(cidr: &str) -> Router {
        Router::new(RouterConfig {
            cidr: cidr.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            Router::new(RouterConfig::default()),
            Err(Error::MissingCidr)
        ));
        assert!(matches!(
            Router::new(RouterConfig {
                cidr: "not-a-cidr".to_string(),
                ..Default::default()
            }),
            Err(Error::InvalidCidr(_))
        ));
        assert!(matches!(
            Router::new(RouterConfig {
                cidr: "1.2.3.0/24".to_string(),
                static_ips: vec!["nope".to_string()],
                ..Default::default()
            }),
            Err(Error::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config: RouterConfig = serde_json::from_str(
            r#"{
                "cidr": "10.0.0.0/24",
                "static_ips": ["27.1.2.3"],
                "nat": {"mode": "OneToOne"},
                "max_queue_size": 16
            }"#,
        )
        .unwrap();
        assert_eq!(config.nat.mode, NatMode::OneToOne);
        assert_eq!(config.max_queue_size, Some(16));

        let router = Router::new(config).unwrap();
        assert_eq!(router.cidr().to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_add_net_assigns_addresses() {
        let wan = router("1.2.3.0/24");

        let net1 = virtual_net();
        wan.add_net(&net1).unwrap();
        let eth0 = net1.interface_by_name("eth0").unwrap();
        assert_eq!(eth0.addrs().unwrap()[0].to_string(), "1.2.3.1/24");

        let net2 = virtual_net();
        wan.add_net(&net2).unwrap();
        let eth0 = net2.interface_by_name("eth0").unwrap();
        assert_eq!(eth0.addrs().unwrap()[0].to_string(), "1.2.3.2/24");
    }

    #[test]
    fn test_add_net_exhaustion() {
        let wan = router("10.0.0.0/30");
        wan.add_net(&virtual_net()).unwrap(); // .1
        wan.add_net(&virtual_net()).unwrap(); // .2
        assert!(matches!(
            wan.add_net(&virtual_net()),
            Err(Error::AddressSpaceExhausted(_))
        ));
    }

    #[test]
    fn test_add_net_rejects_native() {
        let wan = router("1.2.3.0/24");
        let native = Net::new(None).unwrap();
        assert!(matches!(wan.add_net(&native), Err(Error::NativeMode)));
    }

    #[test]
    fn test_dial_via_router() {
        let wan = router("1.2.3.0/24");
        let net = virtual_net();
        wan.add_net(&net).unwrap();

        let conn = net.dial("udp", "27.3.4.5:1234").unwrap();
        assert_eq!(conn.local_addr().ip().to_string(), "1.2.3.1");
        assert_ne!(conn.local_addr().port(), 0);
        assert_eq!(conn.remote_addr().unwrap().to_string(), "27.3.4.5:1234");

        assert_eq!(net.vnet().unwrap().binding_count(), 1);
        conn.close().unwrap();
        assert_eq!(net.vnet().unwrap().binding_count(), 0);
    }

    #[test]
    fn test_dial_via_resolver() {
        let wan = router("1.2.3.0/24");
        wan.add_host("host.example.com", "30.31.32.33".parse().unwrap());

        let net = virtual_net();
        wan.add_net(&net).unwrap();

        let conn = net.dial("udp", "host.example.com:1234").unwrap();
        assert_eq!(conn.local_addr().ip().to_string(), "1.2.3.1");
        assert_eq!(conn.remote_addr().unwrap().to_string(), "30.31.32.33:1234");
        conn.close().unwrap();

        assert!(matches!(
            net.dial("udp", "unknown.example.com:1234"),
            Err(Error::UnknownHost(_))
        ));
    }

    #[test]
    fn test_resolver_chain_through_parent() {
        let wan = router("27.0.0.0/24");
        wan.add_host("host.example.com", "30.31.32.33".parse().unwrap());

        let lan = router("192.168.0.0/24");
        wan.add_router(&lan).unwrap();

        let net = virtual_net();
        lan.add_net(&net).unwrap();

        let addr = net
            .resolve_udp_addr("udp", "host.example.com:1234")
            .unwrap();
        assert_eq!(addr.to_string(), "30.31.32.33:1234");
    }

    #[test]
    fn test_lifecycle() {
        let wan = router("1.2.3.0/24");

        assert!(matches!(wan.stop(), Err(Error::RouterAlreadyStopped)));
        wan.start().unwrap();
        assert!(matches!(wan.start(), Err(Error::RouterAlreadyStarted)));
        wan.stop().unwrap();
        assert!(matches!(wan.stop(), Err(Error::RouterAlreadyStopped)));
        assert!(matches!(wan.start(), Err(Error::RouterAlreadyStopped)));
    }

    #[test]
    fn test_end_to_end_echo() {
        init_tracing();
        let wan = router("1.2.3.0/24");

        let net1 = virtual_net();
        wan.add_net(&net1).unwrap();
        let net2 = virtual_net();
        wan.add_net(&net2).unwrap();

        let conn1 = net1.listen_packet("udp", "1.2.3.1:1234").unwrap();
        let conn2 = net2.listen_packet("udp", "1.2.3.2:5678").unwrap();

        wan.start().unwrap();

        let echo = thread::spawn({
            let conn2 = conn2.clone();
            move || {
                let mut buf = [0u8; 1500];
                while let Ok((n, addr)) = conn2.read_from(&mut buf) {
                    assert_eq!(&buf[..n], b"Hello!");
                    assert_eq!(conn2.write_to(b"Good-bye!", addr).unwrap(), 9);
                }
            }
        });

        assert_eq!(conn1.write_to(b"Hello!", conn2.local_addr()).unwrap(), 6);

        let mut buf = [0u8; 1500];
        let (n, addr) = conn1.read_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Good-bye!");
        assert_eq!(addr, conn2.local_addr());

        conn1.close().unwrap();
        conn2.close().unwrap();
        echo.join().unwrap();
        wan.stop().unwrap();
    }

    #[test]
    fn test_one_to_one_nat() {
        init_tracing();
        let wan = router("27.0.0.0/24");
        let lan = Router::new(RouterConfig {
            cidr: "192.168.0.0/24".to_string(),
            static_ips: vec!["27.0.0.100".to_string()],
            nat: NatType {
                mode: NatMode::OneToOne,
            },
            max_queue_size: None,
        })
        .unwrap();
        wan.add_router(&lan).unwrap();

        let inside = virtual_net();
        lan.add_net(&inside).unwrap(); // 192.168.0.1, mapped to 27.0.0.100
        let outside = virtual_net();
        wan.add_net(&outside).unwrap(); // 27.0.0.1

        let server = outside.listen_packet("udp", "27.0.0.1:8000").unwrap();
        let client = inside.dial("udp", "27.0.0.1:8000").unwrap();
        assert_eq!(client.local_addr().ip().to_string(), "192.168.0.1");

        wan.start().unwrap();
        lan.start().unwrap();

        let server_seen = thread::spawn({
            let server = server.clone();
            move || {
                let mut buf = [0u8; 1500];
                let (n, from) = server.read_from(&mut buf).unwrap();
                assert_eq!(&buf[..n], b"ping");
                // the client is seen under its mapped address
                assert_eq!(from.ip().to_string(), "27.0.0.100");
                assert_eq!(server.write_to(b"pong", from).unwrap(), 4);
                from
            }
        });

        assert_eq!(client.write(b"ping").unwrap(), 4);

        let mut buf = [0u8; 1500];
        let (n, from) = client.read_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from.to_string(), "27.0.0.1:8000");

        let seen = server_seen.join().unwrap();
        assert_eq!(seen.port(), client.local_addr().port(), "1:1 NAT preserves ports");

        client.close().unwrap();
        server.close().unwrap();
        lan.stop().unwrap();
        wan.stop().unwrap();
    }

    #[test]
    fn test_nat_requires_static_ips() {
        let lan = Router::new(RouterConfig {
            cidr: "192.168.0.0/24".to_string(),
            static_ips: vec![],
            nat: NatType {
                mode: NatMode::OneToOne,
            },
            max_queue_size: None,
        })
        .unwrap();
        assert!(matches!(
            lan.add_net(&virtual_net()),
            Err(Error::AddressSpaceExhausted(_))
        ));
    }

    #[test]
    fn test_unrouted_chunk_is_dropped() {
        let wan = router("1.2.3.0/24");
        let net = virtual_net();
        wan.add_net(&net).unwrap();
        wan.start().unwrap();

        // nothing listens on 9.9.9.9 and there is no parent; must not wedge
        // the worker
        wan.push(Chunk::new(
            "1.2.3.1:5000".parse().unwrap(),
            "9.9.9.9:5000".parse().unwrap(),
            b"void".to_vec(),
        ));

        let conn = net.listen_packet("udp", "1.2.3.1:6000").unwrap();
        wan.push(Chunk::new(
            "1.2.3.7:5000".parse().unwrap(),
            "1.2.3.1:6000".parse().unwrap(),
            b"real".to_vec(),
        ));
        let mut buf = [0u8; 16];
        let (n, _) = conn.read_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"real");

        conn.close().unwrap();
        wan.stop().unwrap();
    }
}
