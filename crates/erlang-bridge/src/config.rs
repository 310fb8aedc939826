//! Bridge configuration
//!
//! Loaded from TOML (or JSON when the file name ends in `.json`). Every field
//! has a default so a config file only needs to list what it changes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::Cidr;
use crate::error::{BridgeError, Result};
use crate::logging::LoggingConfig;
use crate::term::StringEncoding;

/// Lowest distribution compatibility release accepted for `compat_rel`
pub const MIN_COMPAT_REL: u32 = 7;

/// Main configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the node listener binds to
    pub listen_ip: IpAddr,
    /// Port the node listener binds to (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Shared secret checked during the handshake
    pub cookie: String,
    /// Local node name, with or without `@host`
    pub nodename: String,
    /// Use the short host form in the node name
    pub shortname: bool,
    /// Host part of the node name; falls back to `$HOSTNAME`
    pub hostname: Option<String>,
    /// How outgoing text is encoded
    pub encoding: StringEncoding,
    /// Distribution compatibility release to advertise
    pub compat_rel: Option<u32>,
    /// Access lists applied, in order, to inbound connections
    pub apply_inbound_acl: Vec<String>,
    /// Named access lists
    pub acl: HashMap<String, AclListConfig>,
    /// Capacity of each listener's event queue
    pub event_queue_capacity: usize,
    /// Capacity of each listener's log queue
    pub log_queue_capacity: usize,
    /// Capacity of each attached session's event queue
    pub session_queue_capacity: usize,
    /// Receive poll bound of the listener loop
    pub poll_interval_ms: u64,
    /// Idle keepalive interval on TCP connections
    pub tick_interval_ms: u64,
    /// How long an engine fetch waits for a peer answer
    pub fetch_timeout_ms: u64,
    /// How long a spawn attach waits for the controller pid
    pub spawn_timeout_ms: u64,
    /// How long a denied connection is given to send its first message
    pub acl_drain_timeout_ms: u64,
    /// Maximum concurrently running background commands
    pub background_workers: usize,
    /// Redelivery of background command completions
    pub bgapi_retry: RetryPolicy,
    /// Static addresses of peer nodes, keyed by `name@host`
    pub peers: HashMap<String, SocketAddr>,
    /// Port used for peers missing from `peers`
    pub default_peer_port: u16,
    pub logging: LoggingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8031,
            cookie: "ClueCon".to_string(),
            nodename: "freeswitch".to_string(),
            shortname: true,
            hostname: None,
            encoding: StringEncoding::String,
            compat_rel: None,
            apply_inbound_acl: Vec::new(),
            acl: HashMap::new(),
            event_queue_capacity: 25_000,
            log_queue_capacity: 25_000,
            session_queue_capacity: 5_000,
            poll_interval_ms: 100,
            tick_interval_ms: 15_000,
            fetch_timeout_ms: 5_000,
            spawn_timeout_ms: 500,
            acl_drain_timeout_ms: 1_000,
            background_workers: 16,
            bgapi_retry: RetryPolicy::default(),
            peers: HashMap::new(),
            default_peer_port: 8031,
            logging: LoggingConfig::default(),
        }
    }
}

/// A named access list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclListConfig {
    /// Verdict when no rule covers the address
    #[serde(default = "AclAction::deny")]
    pub default: AclAction,
    #[serde(default)]
    pub rules: Vec<AclRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRuleConfig {
    pub cidr: String,
    pub action: AclAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Allow,
    Deny,
}

impl AclAction {
    fn deny() -> Self {
        AclAction::Deny
    }
}

/// Retry policy for messages awaiting a peer `{ack, Key}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Resends after the first delivery; 0 disables retrying
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            interval_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config(format!("Cannot read {}: {}", path.display(), e)))?;

        let config: Self = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&contents).map_err(|e| BridgeError::config(e.to_string()))?
        } else {
            toml::from_str(&contents).map_err(|e| BridgeError::config(e.to_string()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| BridgeError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cookie.is_empty() {
            return Err(BridgeError::config("cookie must not be empty"));
        }
        if self.nodename.is_empty() {
            return Err(BridgeError::config("nodename must not be empty"));
        }
        if let Some(rel) = self.compat_rel {
            if rel < MIN_COMPAT_REL {
                return Err(BridgeError::config(format!(
                    "Invalid compatibility release '{}' specified, must be >= {}",
                    rel, MIN_COMPAT_REL
                )));
            }
        }
        if self.event_queue_capacity == 0 || self.log_queue_capacity == 0 || self.session_queue_capacity == 0 {
            return Err(BridgeError::config("queue capacities must be positive"));
        }
        if self.poll_interval_ms == 0 || self.tick_interval_ms == 0 {
            return Err(BridgeError::config("poll and tick intervals must be positive"));
        }
        if self.background_workers == 0 {
            return Err(BridgeError::config("background_workers must be positive"));
        }
        self.logging.level()?;

        for name in &self.apply_inbound_acl {
            if !self.acl.contains_key(name) && name.parse::<Cidr>().is_err() {
                return Err(BridgeError::config(format!("Unknown access list '{}'", name)));
            }
        }
        for (name, list) in &self.acl {
            for rule in &list.rules {
                rule.cidr.parse::<Cidr>().map_err(|_| {
                    BridgeError::config(format!("Bad CIDR '{}' in access list '{}'", rule.cidr, name))
                })?;
            }
        }
        Ok(())
    }

    /// Fully qualified node name
    pub fn node_name(&self) -> String {
        if self.nodename.contains('@') {
            return self.nodename.clone();
        }

        let host = self
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        let host = if self.shortname {
            host.split('.').next().unwrap_or(&host).to_string()
        } else {
            host
        };

        format!("{}@{}", self.nodename, host)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn acl_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.acl_drain_timeout_ms)
    }
}
