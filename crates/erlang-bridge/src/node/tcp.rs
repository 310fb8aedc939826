//! TCP node connections
//!
//! Frames are length-delimited. Before any control traffic the two sides run
//! a cookie challenge: each side proves knowledge of the cookie by returning
//! `md5(cookie ++ challenge)` for the other's random challenge. After that
//! either side sends a tick when it has been idle for a tick interval, and a
//! receiver that hears nothing for four intervals drops the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::node::{split_node_name, ControlMessage, Frame, FrameCodec, NodeConnection, RefGenerator};
use crate::term::Pid;

/// Bound on the whole handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Peers are considered gone after this many silent tick intervals
const SILENT_TICKS: u32 = 4;

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    Hello { node: String, version: u32 },
    Challenge { node: String, challenge: u32 },
    ChallengeReply { challenge: u32, digest: [u8; 16] },
    ChallengeAck { digest: [u8; 16] },
    Refused { reason: String },
}

/// Settings shared by every TCP connection of one local node
pub struct NodeSettings {
    pub local_node: String,
    pub cookie: String,
    pub version: u32,
    pub tick: Duration,
    pub codec: Arc<dyn FrameCodec>,
    pub refs: Arc<RefGenerator>,
}

/// Digest proving knowledge of `cookie` for `challenge`
pub fn gen_digest(cookie: &str, challenge: u32) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(cookie.as_bytes());
    hasher.update(challenge.to_string().as_bytes());
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

async fn write_handshake(transport: &mut Transport, message: &Handshake) -> Result<()> {
    let bytes = bincode::serialize(message)?;
    transport.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn read_handshake(transport: &mut Transport) -> Result<Handshake> {
    match transport.next().await {
        Some(Ok(bytes)) => Ok(bincode::deserialize(&bytes)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(BridgeError::closed("connection closed during handshake")),
    }
}

async fn accept_handshake(transport: &mut Transport, settings: &NodeSettings) -> Result<String> {
    let peer_node = match read_handshake(transport).await? {
        Handshake::Hello { node, version } => {
            debug!("Handshake hello from {} (version {})", node, version);
            node
        }
        other => return Err(BridgeError::handshake(format!("expected hello, got {:?}", other))),
    };
    if split_node_name(&peer_node).is_none() {
        write_handshake(transport, &Handshake::Refused { reason: "bad_name".into() }).await?;
        return Err(BridgeError::handshake(format!("invalid node name '{}'", peer_node)));
    }

    let challenge = rand::random::<u32>();
    write_handshake(
        transport,
        &Handshake::Challenge {
            node: settings.local_node.clone(),
            challenge,
        },
    )
    .await?;

    let (peer_challenge, digest) = match read_handshake(transport).await? {
        Handshake::ChallengeReply { challenge, digest } => (challenge, digest),
        other => return Err(BridgeError::handshake(format!("expected challenge reply, got {:?}", other))),
    };
    if digest != gen_digest(&settings.cookie, challenge) {
        write_handshake(transport, &Handshake::Refused { reason: "not_allowed".into() }).await?;
        return Err(BridgeError::handshake(format!("cookie mismatch from {}", peer_node)));
    }

    write_handshake(
        transport,
        &Handshake::ChallengeAck {
            digest: gen_digest(&settings.cookie, peer_challenge),
        },
    )
    .await?;
    Ok(peer_node)
}

async fn connect_handshake(transport: &mut Transport, settings: &NodeSettings) -> Result<String> {
    write_handshake(
        transport,
        &Handshake::Hello {
            node: settings.local_node.clone(),
            version: settings.version,
        },
    )
    .await?;

    let (peer_node, challenge) = match read_handshake(transport).await? {
        Handshake::Challenge { node, challenge } => (node, challenge),
        Handshake::Refused { reason } => return Err(BridgeError::handshake(reason)),
        other => return Err(BridgeError::handshake(format!("expected challenge, got {:?}", other))),
    };

    let own_challenge = rand::random::<u32>();
    write_handshake(
        transport,
        &Handshake::ChallengeReply {
            challenge: own_challenge,
            digest: gen_digest(&settings.cookie, challenge),
        },
    )
    .await?;

    match read_handshake(transport).await? {
        Handshake::ChallengeAck { digest } if digest == gen_digest(&settings.cookie, own_challenge) => Ok(peer_node),
        Handshake::ChallengeAck { .. } => Err(BridgeError::handshake(format!("{} answered with a bad digest", peer_node))),
        Handshake::Refused { reason } => Err(BridgeError::handshake(reason)),
        other => Err(BridgeError::handshake(format!("expected challenge ack, got {:?}", other))),
    }
}

/// An established TCP connection to a peer node
pub struct TcpNodeConnection {
    self_pid: Pid,
    peer_node: String,
    remote_addr: SocketAddr,
    sink: Mutex<SplitSink<Transport, Bytes>>,
    stream: Mutex<SplitStream<Transport>>,
    codec: Arc<dyn FrameCodec>,
    tick: Duration,
    last_rx: parking_lot::Mutex<Instant>,
    last_tx: parking_lot::Mutex<Instant>,
    closed: CancellationToken,
}

impl TcpNodeConnection {
    fn new(transport: Transport, peer_node: String, remote_addr: SocketAddr, settings: &NodeSettings) -> Self {
        let (sink, stream) = transport.split();
        Self {
            self_pid: settings.refs.next_pid(),
            peer_node,
            remote_addr,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            codec: settings.codec.clone(),
            tick: settings.tick,
            last_rx: parking_lot::Mutex::new(Instant::now()),
            last_tx: parking_lot::Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::closed("connection closed"));
        }
        let bytes = self.codec.encode(frame)?;
        let mut sink = self.sink.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => return Err(BridgeError::closed("connection closed")),
            sent = sink.send(bytes) => sent?,
        }
        *self.last_tx.lock() = Instant::now();
        Ok(())
    }

    async fn tick_if_idle(&self) -> Result<()> {
        let idle = self.last_tx.lock().elapsed();
        if idle >= self.tick {
            self.write_frame(&Frame::Tick).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeConnection for TcpNodeConnection {
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
        self.write_frame(&Frame::Control(message)).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<ControlMessage>> {
        self.tick_if_idle().await?;

        let mut stream = self.stream.lock().await;
        let next = tokio::select! {
            _ = self.closed.cancelled() => return Err(BridgeError::closed("connection closed")),
            next = tokio::time::timeout(timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                let silent = self.last_rx.lock().elapsed();
                if silent > self.tick * SILENT_TICKS {
                    return Err(BridgeError::timeout(format!(
                        "no traffic from {} for {:?}",
                        self.peer_node, silent
                    )));
                }
                Ok(None)
            }
            Ok(None) => Err(BridgeError::closed(format!("{} closed the connection", self.peer_node))),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(bytes))) => {
                *self.last_rx.lock() = Instant::now();
                match self.codec.decode(&bytes)? {
                    Frame::Tick => Ok(None),
                    Frame::Control(message) => Ok(Some(message)),
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("Error closing connection to {}: {}", self.peer_node, e);
        }
    }
}

/// Accepted socket that has not been authenticated yet
pub struct PendingConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    settings: Arc<NodeSettings>,
}

impl PendingConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Run the cookie challenge as the accepting side
    pub async fn handshake(self) -> Result<TcpNodeConnection> {
        let mut transport = Framed::new(self.stream, LengthDelimitedCodec::new());
        let peer_node = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_handshake(&mut transport, &self.settings))
            .await
            .map_err(|_| BridgeError::timeout(format!("handshake with {}", self.remote_addr)))??;
        debug!("Accepted node {} from {}", peer_node, self.remote_addr);
        Ok(TcpNodeConnection::new(transport, peer_node, self.remote_addr, &self.settings))
    }
}

/// Listening socket for inbound node connections
pub struct TcpNodeAcceptor {
    listener: TcpListener,
    settings: Arc<NodeSettings>,
}

impl TcpNodeAcceptor {
    pub async fn bind(addr: SocketAddr, settings: Arc<NodeSettings>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, settings })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<PendingConnection> {
        let (stream, remote_addr) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }
        Ok(PendingConnection {
            stream,
            remote_addr,
            settings: self.settings.clone(),
        })
    }
}

/// Opens outbound connections to named peer nodes
pub struct TcpConnector {
    settings: Arc<NodeSettings>,
    peers: HashMap<String, SocketAddr>,
    default_port: u16,
}

impl TcpConnector {
    pub fn new(settings: Arc<NodeSettings>, peers: HashMap<String, SocketAddr>, default_port: u16) -> Self {
        Self {
            settings,
            peers,
            default_port,
        }
    }

    /// Address to dial for `node`
    pub fn resolve(&self, node: &str) -> Result<String> {
        if let Some(addr) = self.peers.get(node) {
            return Ok(addr.to_string());
        }
        let (_, host) = split_node_name(node)
            .ok_or_else(|| BridgeError::invalid_argument(format!("invalid node name '{}'", node)))?;
        Ok(format!("{}:{}", host, self.default_port))
    }

    pub async fn connect(&self, node: &str) -> Result<TcpNodeConnection> {
        let target = self.resolve(node)?;
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&target))
            .await
            .map_err(|_| BridgeError::timeout(format!("connecting to {} at {}", node, target)))??;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;

        let mut transport = Framed::new(stream, LengthDelimitedCodec::new());
        let peer_node = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_handshake(&mut transport, &self.settings))
            .await
            .map_err(|_| BridgeError::timeout(format!("handshake with {}", node)))??;

        if peer_node != node {
            debug!("Dialled {} but peer calls itself {}", node, peer_node);
        }
        Ok(TcpNodeConnection::new(transport, peer_node, remote_addr, &self.settings))
    }
}
