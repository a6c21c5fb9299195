//! Hostname resolution inside the simulated network.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, Weak};

/// Name-to-IP table owned by a router and consulted by its child nets during
/// dial. Lookups that miss locally walk up to the parent router's resolver.
#[derive(Debug, Default)]
pub struct Resolver {
    hosts: Mutex<HashMap<String, IpAddr>>,
    parent: Mutex<Weak<Resolver>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hostname, overwriting any prior mapping.
    pub fn add_host(&self, name: impl Into<String>, ip: IpAddr) {
        let name = name.into();
        tracing::debug!(host = %name, ip = %ip, "host registered");
        self.hosts.lock().unwrap().insert(name, ip);
    }

    pub fn lookup_host(&self, name: &str) -> Result<IpAddr> {
        if let Some(ip) = self.hosts.lock().unwrap().get(name) {
            return Ok(*ip);
        }
        if let Some(parent) = self.parent.lock().unwrap().upgrade() {
            return parent.lookup_host(name);
        }
        Err(Error::UnknownHost(name.to_string()))
    }

    pub(crate) fn set_parent(&self, parent: Weak<Resolver>) {
        *self.parent.lock().unwrap() = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lookup() {
        let resolver = Resolver::new();
        resolver.add_host("test.example.ly", "30.31.32.33".parse().unwrap());

        let ip = resolver.lookup_host("test.example.ly").unwrap();
        assert_eq!(ip.to_string(), "30.31.32.33");

        assert!(matches!(
            resolver.lookup_host("unknown.example.ly"),
            Err(Error::UnknownHost(_))
        ));
    }

    #[test]
    fn test_add_host_overwrites() {
        let resolver = Resolver::new();
        resolver.add_host("host.example.ly", "1.1.1.1".parse().unwrap());
        resolver.add_host("host.example.ly", "2.2.2.2".parse().unwrap());
        assert_eq!(resolver.lookup_host("host.example.ly").unwrap().to_string(), "2.2.2.2");
    }

    #[test]
    fn test_lookup_walks_parent_chain() {
        let wan = Arc::new(Resolver::new());
        wan.add_host("wan.example.ly", "27.1.1.1".parse().unwrap());

        let lan = Resolver::new();
        lan.set_parent(Arc::downgrade(&wan));
        lan.add_host("lan.example.ly", "192.168.0.5".parse().unwrap());

        assert_eq!(lan.lookup_host("lan.example.ly").unwrap().to_string(), "192.168.0.5");
        assert_eq!(lan.lookup_host("wan.example.ly").unwrap().to_string(), "27.1.1.1");
        assert!(lan.lookup_host("nowhere.example.ly").is_err());
    }
}
