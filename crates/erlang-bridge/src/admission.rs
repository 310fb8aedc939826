//! Inbound connection admission
//!
//! Access lists are checked in configured order and every one must allow the
//! address. A list name that is not configured is read as a literal CIDR that
//! allows only the addresses it covers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{AclAction, AclListConfig, BridgeConfig};
use crate::error::{BridgeError, Result};
use crate::node::NodeConnection;
use crate::term::Term;

/// An address block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| BridgeError::invalid_argument(format!("bad address in '{}'", s)))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| BridgeError::invalid_argument(format!("bad prefix in '{}'", s)))?,
            None => max,
        };
        Ok(Self { network, prefix })
    }
}

#[derive(Debug, Clone)]
struct AccessList {
    default: AclAction,
    rules: Vec<(Cidr, AclAction)>,
}

impl AccessList {
    fn from_config(config: &AclListConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| Ok((rule.cidr.parse::<Cidr>()?, rule.action)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            default: config.default,
            rules,
        })
    }

    /// Most specific covering rule wins
    fn evaluate(&self, addr: IpAddr) -> AclAction {
        self.rules
            .iter()
            .filter(|(cidr, _)| cidr.contains(addr))
            .max_by_key(|(cidr, _)| cidr.prefix())
            .map(|(_, action)| *action)
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
enum Check {
    List(String, AccessList),
    Literal(Cidr),
}

/// Ordered access checks for inbound connections
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    checks: Vec<Check>,
}

impl AdmissionPolicy {
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::build(&config.apply_inbound_acl, &config.acl)
    }

    fn build(names: &[String], lists: &HashMap<String, AclListConfig>) -> Result<Self> {
        let checks = names
            .iter()
            .map(|name| match lists.get(name) {
                Some(list) => Ok(Check::List(name.clone(), AccessList::from_config(list)?)),
                None => name
                    .parse::<Cidr>()
                    .map(Check::Literal)
                    .map_err(|_| BridgeError::config(format!("Unknown access list '{}'", name))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { checks })
    }

    /// Whether a connection from `addr` may proceed
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.checks.iter().all(|check| match check {
            Check::List(name, list) => {
                let allowed = list.evaluate(addr) == AclAction::Allow;
                if !allowed {
                    debug!("Access list {} denies {}", name, addr);
                }
                allowed
            }
            Check::Literal(cidr) => cidr.contains(addr),
        })
    }
}

/// Turn away a connection that failed admission
///
/// Waits briefly for the peer's first message so the refusal can be addressed
/// to the process that sent it, then closes the connection.
pub async fn reject(conn: &dyn NodeConnection, drain_timeout: Duration) {
    let addr = conn
        .remote_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    warn!("Connection from {} ({}) denied by access rules", addr, conn.peer_node());

    match conn.receive(drain_timeout).await {
        Ok(Some(message)) => {
            let from = message.from().clone();
            if let Err(e) = conn.send_to(&from, Term::error("acldeny")).await {
                debug!("Could not deliver acldeny to {}: {}", from, e);
            }
        }
        Ok(None) => debug!("Denied peer {} sent nothing", addr),
        Err(e) => debug!("Denied peer {} went away: {}", addr, e),
    }
    conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclRuleConfig;
    use crate::node::memory;
    use crate::term::Pid;
    use std::net::{Ipv4Addr, SocketAddr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_matching() {
        let lan: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(lan.contains(ip("10.1.2.3")));
        assert!(!lan.contains(ip("11.0.0.1")));
        assert!(lan.contains(ip("::ffff:10.0.0.9")));

        let host: Cidr = "192.0.2.5".parse().unwrap();
        assert_eq!(host.prefix(), 32);
        assert!(host.contains(ip("192.0.2.5")));
        assert!(!host.contains(ip("192.0.2.6")));

        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(ip("203.0.113.1")));
        assert!(!any.contains(ip("::1")));

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("nonsense".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let lists = HashMap::from([(
            "lan".to_string(),
            AclListConfig {
                default: AclAction::Deny,
                rules: vec![
                    AclRuleConfig { cidr: "10.0.0.0/8".into(), action: AclAction::Allow },
                    AclRuleConfig { cidr: "10.9.0.0/16".into(), action: AclAction::Deny },
                ],
            },
        )]);
        let policy = AdmissionPolicy::build(&["lan".to_string()], &lists).unwrap();
        assert!(policy.allows(ip("10.1.0.1")));
        assert!(!policy.allows(ip("10.9.0.1")));
        assert!(!policy.allows(ip("192.168.0.1")));
    }

    #[test]
    fn test_every_list_must_allow() {
        let policy = AdmissionPolicy::build(
            &["127.0.0.0/8".to_string(), "127.0.0.1".to_string()],
            &HashMap::new(),
        )
        .unwrap();
        assert!(policy.allows(ip("127.0.0.1")));
        assert!(!policy.allows(ip("127.0.0.2")));
        assert!(AdmissionPolicy::default().allows(ip("198.51.100.7")));
        assert!(AdmissionPolicy::build(&["missing".to_string()], &HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_reject_answers_acldeny_then_closes() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 4000);
        let (conn, peer) = memory::pair_with_addr(Pid::new("fs@host", 1, 0, 1), "intruder@box", addr);

        peer.send(Term::atom("getpid")).unwrap();
        reject(&conn, Duration::from_millis(200)).await;

        let reply = peer.recv_term(Duration::from_millis(200)).await.unwrap();
        assert_eq!(reply, Term::error("acldeny"));
        assert!(peer.is_closed());
    }
}
