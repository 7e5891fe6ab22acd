//! # Address Module
//!
//! This module defines the network address candidates a service can be reached at.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::SurgeError;

/// A single service endpoint
#[derive(Debug, Clone)]
pub struct AddressModel {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Weight value (informational, not part of identity)
    pub weight: u32,
}

impl AddressModel {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 100,
        }
    }

    /// Set weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Equality/hash key used by selectors, rings and health records ("host:port")
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address string usable with `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            self.key()
        }
    }
}

impl fmt::Display for AddressModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl PartialEq for AddressModel {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for AddressModel {}

impl Hash for AddressModel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for AddressModel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressModel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.host, self.port).cmp(&(&other.host, other.port))
    }
}

impl FromStr for AddressModel {
    type Err = SurgeError;

    /// Parse "host:port" (IPv6 hosts in brackets: "[::1]:8080")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SurgeError::Config(format!("invalid address: {}", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(SurgeError::Config(format!("missing host in address: {}", s)));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| SurgeError::Config(format!("invalid port in address: {}", s)))?;
        if port == 0 {
            return Err(SurgeError::Config(format!("port must be non-zero: {}", s)));
        }

        Ok(Self::new(host, port))
    }
}

/// Parse a comma separated address list, e.g. "10.0.0.1:80,10.0.0.2:80"
pub fn parse_address_list(s: &str) -> crate::Result<Vec<AddressModel>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(AddressModel::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_address_new() {
        let addr = AddressModel::new("127.0.0.1", 10000);
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 10000);
        assert_eq!(addr.key(), "127.0.0.1:10000");
    }

    #[test]
    fn test_address_equality_ignores_weight() {
        let a1 = AddressModel::new("127.0.0.1", 10000);
        let a2 = AddressModel::new("127.0.0.1", 10000).with_weight(5);
        let a3 = AddressModel::new("127.0.0.1", 10001);

        assert_eq!(a1, a2);
        assert_ne!(a1, a3);

        let set: HashSet<_> = vec![a1, a2, a3].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_address_parse() {
        let addr: AddressModel = "192.168.1.1:8080".parse().unwrap();
        assert_eq!(addr.host, "192.168.1.1");
        assert_eq!(addr.port, 8080);

        let v6: AddressModel = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.socket_addr(), "[::1]:9000");

        assert!("no-port".parse::<AddressModel>().is_err());
        assert!("host:0".parse::<AddressModel>().is_err());
        assert!(":80".parse::<AddressModel>().is_err());
    }

    #[test]
    fn test_parse_address_list() {
        let list = parse_address_list("10.0.0.1:80, 10.0.0.2:81,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].port, 81);
    }
}
