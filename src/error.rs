use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("invalid port range: {0}..{1}")]
    InvalidPortRange(u16, u16),

    #[error("missing CIDR")]
    MissingCidr,

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("message too long for interface MTU")]
    MessageTooLong,

    #[error("no such interface: {0}")]
    NoSuchInterface(String),

    #[error("no address assigned to interface {0}")]
    NoAddressAssigned(String),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("address not available: {0}")]
    AddressUnavailable(IpAddr),

    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("no free port in the given range")]
    NoFreePort,

    #[error("no route to {0}")]
    NoRoute(IpAddr),

    #[error("use of closed connection")]
    Closed,

    #[error("connection has no remote address")]
    NotConnected,

    #[error("address space exhausted in {0}")]
    AddressSpaceExhausted(String),

    #[error("router already started")]
    RouterAlreadyStarted,

    #[error("router already stopped")]
    RouterAlreadyStopped,

    #[error("operation not supported in native mode")]
    NativeMode,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
