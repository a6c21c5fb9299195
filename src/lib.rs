//! An in-process virtual IP network for exercising UDP protocols in tests.
//!
//! Build topologies of hosts ([`Net`]), LANs and WANs ([`Router`]) and NATed
//! segments without touching kernel sockets. Bindings opened through a
//! virtual [`Net`] behave like host UDP sockets (blocking reads, best-effort
//! delivery) while staying fully deterministic and unprivileged.

mod addr;
mod chunk;
mod conn;
mod error;
mod interface;
mod nat;
mod native;
mod net;
mod resolver;
mod router;

pub use addr::IpNet;
pub use chunk::Chunk;
pub use conn::UdpPacketConn;
pub use error::{Error, Result};
pub use interface::{HardwareAddr, Interface, InterfaceFlags};
pub use nat::{NatMode, NatType};
pub use net::{Net, NetConfig};
pub use resolver::Resolver;
pub use router::{Router, RouterConfig};
