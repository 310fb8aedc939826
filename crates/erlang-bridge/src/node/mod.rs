//! Node-to-node connections
//!
//! A [`NodeConnection`] carries [`ControlMessage`]s between the bridge and one
//! peer node. Two implementations ship with the crate: TCP with a cookie
//! handshake ([`tcp`]) and an in-process pair ([`memory`]).

pub mod codec;
pub mod memory;
pub mod refs;
pub mod tcp;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::term::{Pid, Term};

pub use codec::{BincodeCodec, FrameCodec};
pub use memory::{MemoryConnection, PeerHandle};
pub use refs::RefGenerator;
pub use tcp::{TcpConnector, TcpNodeAcceptor, TcpNodeConnection};

/// Distribution control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Message to a pid
    Send { from: Pid, to: Pid, message: Term },
    /// Message to a registered name
    RegSend { from: Pid, to_name: String, message: Term },
    Link { from: Pid, to: Pid },
    Unlink { from: Pid, to: Pid },
    /// A linked process went away
    Exit { from: Pid, to: Pid, reason: Term },
}

impl ControlMessage {
    /// The sending process
    pub fn from(&self) -> &Pid {
        match self {
            ControlMessage::Send { from, .. }
            | ControlMessage::RegSend { from, .. }
            | ControlMessage::Link { from, .. }
            | ControlMessage::Unlink { from, .. }
            | ControlMessage::Exit { from, .. } => from,
        }
    }

    /// Payload of a send
    pub fn message(&self) -> Option<&Term> {
        match self {
            ControlMessage::Send { message, .. } | ControlMessage::RegSend { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// A process on the peer node, by pid or registered name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessAddress {
    Pid(Pid),
    Name(String),
}

impl std::fmt::Display for ProcessAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessAddress::Pid(pid) => write!(f, "{}", pid),
            ProcessAddress::Name(name) => f.write_str(name),
        }
    }
}

/// One unit on the wire after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Keepalive
    Tick,
    Control(ControlMessage),
}

/// A live connection to one peer node
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// Pid the bridge uses as its own identity on this connection
    fn self_pid(&self) -> &Pid;

    /// Name of the node on the other end
    fn peer_node(&self) -> &str;

    fn remote_addr(&self) -> Option<SocketAddr>;

    async fn send(&self, message: ControlMessage) -> Result<()>;

    /// Wait up to `timeout` for the next control message
    ///
    /// Returns `Ok(None)` when the wait elapsed or only a keepalive arrived.
    async fn receive(&self, timeout: Duration) -> Result<Option<ControlMessage>>;

    async fn close(&self);

    async fn send_to(&self, to: &Pid, message: Term) -> Result<()> {
        self.send(ControlMessage::Send {
            from: self.self_pid().clone(),
            to: to.clone(),
            message,
        })
        .await
    }

    async fn reg_send(&self, name: &str, message: Term) -> Result<()> {
        self.send(ControlMessage::RegSend {
            from: self.self_pid().clone(),
            to_name: name.to_string(),
            message,
        })
        .await
    }

    async fn send_to_address(&self, to: &ProcessAddress, message: Term) -> Result<()> {
        match to {
            ProcessAddress::Pid(pid) => self.send_to(pid, message).await,
            ProcessAddress::Name(name) => self.reg_send(name, message).await,
        }
    }

    async fn link(&self, to: &Pid) -> Result<()> {
        self.send(ControlMessage::Link {
            from: self.self_pid().clone(),
            to: to.clone(),
        })
        .await
    }
}

/// Split `name@host` into its parts
pub fn split_node_name(node: &str) -> Option<(&str, &str)> {
    let (name, host) = node.split_once('@')?;
    if name.is_empty() || host.is_empty() {
        return None;
    }
    Some((name, host))
}
