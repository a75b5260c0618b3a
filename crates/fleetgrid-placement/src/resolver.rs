//! Hostname lookup for new container nodes.

use std::collections::BTreeMap;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no hostname recorded for {0}")]
    NoRecord(IpAddr),

    #[error("lookup of {ip} failed: {reason}")]
    Lookup { ip: IpAddr, reason: String },
}

/// Maps an address handed to a new child node to the hostname it is known by.
pub trait NameResolver: Send + Sync {
    fn hostname_for(&self, ip: IpAddr) -> Result<String, ResolveError>;
}

/// In-memory resolver for tests and the simulator.
///
/// With `any_lookup` set, addresses without an explicit record resolve to a
/// name derived from the address itself.
#[derive(Debug, Clone, Default)]
pub struct MemoryNameResolver {
    records: BTreeMap<IpAddr, String>,
    any_lookup: bool,
}

impl MemoryNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn any_lookup() -> Self {
        Self {
            records: BTreeMap::new(),
            any_lookup: true,
        }
    }

    pub fn with_record(mut self, ip: IpAddr, hostname: &str) -> Self {
        self.records.insert(ip, hostname.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl NameResolver for MemoryNameResolver {
    fn hostname_for(&self, ip: IpAddr) -> Result<String, ResolveError> {
        if let Some(hostname) = self.records.get(&ip) {
            return Ok(hostname.clone());
        }
        if self.any_lookup {
            let label: String = ip
                .to_string()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect();
            return Ok(format!("node-{label}"));
        }
        Err(ResolveError::NoRecord(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn explicit_records_win() {
        let resolver = MemoryNameResolver::any_lookup().with_record(ip("10.0.0.5"), "web-5");
        assert_eq!(resolver.hostname_for(ip("10.0.0.5")).unwrap(), "web-5");
        assert_eq!(resolver.hostname_for(ip("10.0.0.6")).unwrap(), "node-10-0-0-6");
    }

    #[test]
    fn v6_addresses_get_dns_safe_names() {
        let resolver = MemoryNameResolver::any_lookup();
        assert_eq!(resolver.hostname_for(ip("fd00::1")).unwrap(), "node-fd00--1");
    }

    #[test]
    fn strict_resolver_rejects_unknown_addresses() {
        let resolver = MemoryNameResolver::new().with_record(ip("10.0.0.5"), "web-5");
        assert_eq!(resolver.len(), 1);
        assert_eq!(
            resolver.hostname_for(ip("10.0.0.6")),
            Err(ResolveError::NoRecord(ip("10.0.0.6")))
        );
    }
}
