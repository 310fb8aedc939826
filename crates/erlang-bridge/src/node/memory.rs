//! In-process node connection
//!
//! [`pair`] returns the bridge side of a connection together with a
//! [`PeerHandle`] that plays the remote node. Hosts use it to embed peers in
//! the same process; tests use it to drive listeners without sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::node::{ControlMessage, NodeConnection, ProcessAddress};
use crate::term::{Pid, Term};

/// Bridge side of an in-process connection
pub struct MemoryConnection {
    self_pid: Pid,
    peer_node: String,
    remote_addr: SocketAddr,
    inbound: Mutex<mpsc::UnboundedReceiver<ControlMessage>>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    closed: CancellationToken,
}

/// Remote side of an in-process connection
pub struct PeerHandle {
    node: String,
    pid: Pid,
    bridge_pid: Pid,
    to_bridge: mpsc::UnboundedSender<ControlMessage>,
    from_bridge: Mutex<mpsc::UnboundedReceiver<ControlMessage>>,
    next_pid: AtomicU32,
    closed: CancellationToken,
}

/// Connect a bridge endpoint `bridge_pid` to a simulated node `peer_node`
pub fn pair(bridge_pid: Pid, peer_node: &str) -> (MemoryConnection, PeerHandle) {
    pair_with_addr(bridge_pid, peer_node, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
}

pub fn pair_with_addr(bridge_pid: Pid, peer_node: &str, remote_addr: SocketAddr) -> (MemoryConnection, PeerHandle) {
    let (to_bridge, inbound) = mpsc::unbounded_channel();
    let (outbound, from_bridge) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let conn = MemoryConnection {
        self_pid: bridge_pid.clone(),
        peer_node: peer_node.to_string(),
        remote_addr,
        inbound: Mutex::new(inbound),
        outbound,
        closed: closed.clone(),
    };
    let peer = PeerHandle {
        node: peer_node.to_string(),
        pid: Pid::new(peer_node, 1, 0, 1),
        bridge_pid,
        to_bridge,
        from_bridge: Mutex::new(from_bridge),
        next_pid: AtomicU32::new(2),
        closed,
    };
    (conn, peer)
}

#[async_trait]
impl NodeConnection for MemoryConnection {
    fn self_pid(&self) -> &Pid {
        &self.self_pid
    }

    fn peer_node(&self) -> &str {
        &self.peer_node
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    async fn send(&self, message: ControlMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::closed("memory connection closed"));
        }
        self.outbound
            .send(message)
            .map_err(|_| BridgeError::closed("peer dropped"))
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<ControlMessage>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(BridgeError::closed("memory connection closed")),
            received = tokio::time::timeout(timeout, inbound.recv()) => match received {
                Ok(Some(message)) => Ok(Some(message)),
                Ok(None) => Err(BridgeError::closed("peer dropped")),
                Err(_) => Ok(None),
            },
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

impl PeerHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Default process of the simulated node
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// The bridge endpoint this peer talks to
    pub fn bridge_pid(&self) -> &Pid {
        &self.bridge_pid
    }

    /// Another process on the simulated node
    pub fn new_pid(&self) -> Pid {
        Pid::new(self.node.clone(), self.next_pid.fetch_add(1, Ordering::Relaxed), 0, 1)
    }

    pub fn deliver(&self, message: ControlMessage) -> Result<()> {
        self.to_bridge
            .send(message)
            .map_err(|_| BridgeError::closed("bridge side dropped"))
    }

    /// Send `message` to the bridge endpoint from the default process
    pub fn send(&self, message: Term) -> Result<()> {
        self.send_from(&self.pid.clone(), message)
    }

    pub fn send_from(&self, from: &Pid, message: Term) -> Result<()> {
        self.deliver(ControlMessage::Send {
            from: from.clone(),
            to: self.bridge_pid.clone(),
            message,
        })
    }

    pub fn reg_send_from(&self, from: &Pid, name: &str, message: Term) -> Result<()> {
        self.deliver(ControlMessage::RegSend {
            from: from.clone(),
            to_name: name.to_string(),
            message,
        })
    }

    /// Report that `pid` exited
    pub fn exit(&self, pid: &Pid) -> Result<()> {
        self.deliver(ControlMessage::Exit {
            from: pid.clone(),
            to: self.bridge_pid.clone(),
            reason: Term::atom("normal"),
        })
    }

    /// Next message from the bridge, whatever its kind
    pub async fn recv(&self, timeout: Duration) -> Option<ControlMessage> {
        let mut from_bridge = self.from_bridge.lock().await;
        tokio::time::timeout(timeout, from_bridge.recv()).await.ok().flatten()
    }

    /// Next `(destination, payload)` sent by the bridge, skipping links
    pub async fn recv_message(&self, timeout: Duration) -> Option<(ProcessAddress, Term)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv(remaining).await? {
                ControlMessage::Send { to, message, .. } => return Some((ProcessAddress::Pid(to), message)),
                ControlMessage::RegSend { to_name, message, .. } => return Some((ProcessAddress::Name(to_name), message)),
                _ => continue,
            }
        }
    }

    /// Payload of the next message sent by the bridge
    pub async fn recv_term(&self, timeout: Duration) -> Option<Term> {
        self.recv_message(timeout).await.map(|(_, term)| term)
    }

    /// Whether the bridge closed its side
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Drop the connection from the peer side
    pub fn disconnect(&self) {
        self.closed.cancel();
    }
}
