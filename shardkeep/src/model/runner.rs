use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network address of a runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnerAddress {
    pub host: std::net::IpAddr,
    pub port: u16,
}

impl RunnerAddress {
    pub fn new(host: std::net::IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for RunnerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RunnerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.parse()?;
        Ok(Self {
            host: addr.ip(),
            port: addr.port(),
        })
    }
}

impl From<SocketAddr> for RunnerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
        }
    }
}

/// A runner registered with the shard manager: where it lives, which shard
/// groups it will host, and its relative weight for load distribution.
///
/// Equality compares only `address` and `weight`, per the cluster's notion
/// of "the same runner" — `groups` can be re-announced on a later
/// registration without the runner being treated as a different one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub address: RunnerAddress,
    pub groups: Vec<String>,
    pub weight: u32,
}

impl PartialEq for Runner {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.weight == other.weight
    }
}

impl Runner {
    pub fn new(address: RunnerAddress, groups: Vec<String>, weight: u32) -> Self {
        Self {
            address,
            groups,
            weight,
        }
    }

    pub fn hosts_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display_roundtrip() {
        let addr: RunnerAddress = "127.0.0.1:7432".parse().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:7432");
        assert_eq!(addr.port, 7432);
    }

    #[test]
    fn test_runner_equality_ignores_groups() {
        let a = Runner::new("127.0.0.1:1".parse().unwrap(), vec!["default".into()], 1);
        let b = Runner::new("127.0.0.1:1".parse().unwrap(), vec!["other".into()], 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_runner_inequality_on_weight() {
        let a = Runner::new("127.0.0.1:1".parse().unwrap(), vec!["default".into()], 1);
        let b = Runner::new("127.0.0.1:1".parse().unwrap(), vec!["default".into()], 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hosts_group() {
        let runner = Runner::new(
            "127.0.0.1:1".parse().unwrap(),
            vec!["default".into(), "billing".into()],
            2,
        );
        assert!(runner.hosts_group("billing"));
        assert!(!runner.hosts_group("other"));
    }
}
