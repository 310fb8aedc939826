//! Bridge root
//!
//! [`ErlangBridge`] owns the shared context (listener registry, fetch
//! bindings, attached-call index, command pool, handler table) and the
//! network edges: the accept loop for inbound nodes and the connector for
//! outbound ones. The engine talks to it through [`ErlangBridge::publish`],
//! [`ErlangBridge::log`] and [`ErlangBridge::fetch`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::admission::{self, AdmissionPolicy};
use crate::commands::CommandPool;
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::engine::CallEngine;
use crate::error::{BridgeError, Result};
use crate::event::{Event, LogEntry};
use crate::fetch::{self, FetchBindings, FetchRequest, PendingFetches};
use crate::listener::{main_loop, Direction, Listener, ListenerId, ListenerState};
use crate::node::memory::{self, PeerHandle};
use crate::node::tcp::NodeSettings;
use crate::node::{BincodeCodec, NodeConnection, ProcessAddress, RefGenerator, TcpConnector, TcpNodeAcceptor};
use crate::registry::ListenerRegistry;
use crate::session::{self, AttachTarget, SessionHandle};
use crate::term::Term;

/// Distribution version advertised when `compat_rel` is not set
const DISTRIBUTION_VERSION: u32 = 5;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// State shared by every listener task
pub(crate) struct BridgeContext {
    pub config: BridgeConfig,
    pub engine: Arc<dyn CallEngine>,
    pub refs: Arc<RefGenerator>,
    pub registry: ListenerRegistry,
    pub bindings: FetchBindings,
    pub fetches: PendingFetches,
    /// Call uuid to the listener controlling it
    pub attached: DashMap<String, ListenerId>,
    pub commands: CommandPool,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
}

/// The bridge between the call engine and Erlang nodes
///
/// ```
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use rvoip_erlang_bridge::prelude::*;
/// # struct Engine;
/// # impl CallEngine for Engine {
/// #     fn execute_api(&self, _: &str, _: &str) -> Option<String> { None }
/// #     fn fire_event(&self, _: Event) {}
/// #     fn call_data(&self, _: &str) -> Option<Event> { None }
/// #     fn queue_call_message(&self, _: &str, _: Event) -> bool { false }
/// #     fn set_call_controlled(&self, _: &str, _: bool) {}
/// # }
/// # tokio_test::block_on(async {
/// let config = BridgeConfig::default();
/// rvoip_erlang_bridge::logging::setup_logging(&config.logging).unwrap();
/// let bridge = ErlangBridge::new(config, Arc::new(Engine)).unwrap();
/// let (_listener, peer) = bridge.add_memory_peer("ctl@box");
///
/// peer.send(Term::tuple(vec![Term::atom("event"), Term::atom("CHANNEL_ANSWER")])).unwrap();
/// assert_eq!(peer.recv_term(Duration::from_secs(1)).await, Some(Term::ok()));
///
/// bridge.publish(&Event::new(EventType::ChannelAnswer));
/// assert!(peer.recv_term(Duration::from_secs(1)).await.is_some());
/// bridge.shutdown().await;
/// # });
/// ```
pub struct ErlangBridge {
    ctx: Arc<BridgeContext>,
    admission: Arc<AdmissionPolicy>,
    settings: Arc<NodeSettings>,
    connector: TcpConnector,
    /// Serialises outbound connects so one node gets one listener
    outbound: Mutex<()>,
}

impl ErlangBridge {
    pub fn new(config: BridgeConfig, engine: Arc<dyn CallEngine>) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(AdmissionPolicy::from_config(&config)?);

        let node_name = config.node_name();
        let refs = Arc::new(RefGenerator::new(node_name.clone()));
        let settings = Arc::new(NodeSettings {
            local_node: node_name,
            cookie: config.cookie.clone(),
            version: config.compat_rel.unwrap_or(DISTRIBUTION_VERSION),
            tick: config.tick_interval(),
            codec: Arc::new(BincodeCodec),
            refs: refs.clone(),
        });
        let connector = TcpConnector::new(settings.clone(), config.peers.clone(), config.default_peer_port);

        let ctx = Arc::new(BridgeContext {
            commands: CommandPool::new(engine.clone(), config.background_workers),
            config,
            engine,
            refs,
            registry: ListenerRegistry::new(),
            bindings: FetchBindings::default(),
            fetches: PendingFetches::default(),
            attached: DashMap::new(),
            dispatcher: Dispatcher::new(),
            shutdown: CancellationToken::new(),
        });

        info!("Erlang bridge node {}", settings.local_node);
        Ok(Self {
            ctx,
            admission,
            settings,
            connector,
            outbound: Mutex::new(()),
        })
    }

    /// Fully qualified name of the local node
    pub fn node_name(&self) -> &str {
        &self.settings.local_node
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.ctx.registry
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.ctx.registry.snapshot()
    }

    pub fn listener_for_node(&self, node: &str) -> Option<Arc<Listener>> {
        self.ctx.registry.find_by_node(node)
    }

    /// Whether some listener controls the call
    pub fn is_attached(&self, uuid: &str) -> bool {
        self.ctx.attached.contains_key(uuid)
    }

    /// Number of processes bound to answer lookups
    pub fn binding_count(&self) -> usize {
        self.ctx.bindings.len()
    }

    /// Bind the listen socket and accept nodes in the background
    pub async fn start(&self) -> Result<SocketAddr> {
        let acceptor = TcpNodeAcceptor::bind(self.ctx.config.listen_addr(), self.settings.clone()).await?;
        let local_addr = acceptor.local_addr()?;
        info!("Listening for nodes on {}", local_addr);

        tokio::spawn(accept_loop(self.ctx.clone(), self.admission.clone(), acceptor));
        Ok(local_addr)
    }

    /// Accept nodes until [`shutdown`](Self::shutdown)
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        self.ctx.shutdown.cancelled().await;
        Ok(())
    }

    /// Serve an already established connection, subject to the access rules
    pub async fn add_connection(&self, conn: Arc<dyn NodeConnection>, direction: Direction) -> Result<Arc<Listener>> {
        if let Some(addr) = conn.remote_addr() {
            if direction == Direction::Inbound && !self.admission.allows(addr.ip()) {
                admission::reject(conn.as_ref(), self.ctx.config.acl_drain_timeout()).await;
                return Err(BridgeError::AccessDenied(addr.ip().to_string()));
            }
        }
        Ok(spawn_listener(&self.ctx, conn, direction))
    }

    /// Serve a node living in this process; returns the listener and the
    /// handle that plays the node
    pub fn add_memory_peer(&self, peer_node: &str) -> (Arc<Listener>, PeerHandle) {
        let (conn, peer) = memory::pair(self.ctx.refs.next_pid(), peer_node);
        let listener = spawn_listener(&self.ctx, Arc::new(conn), Direction::Inbound);
        (listener, peer)
    }

    /// Open a new listener to `node`
    pub async fn connect_outbound(&self, node: &str) -> Result<Arc<Listener>> {
        let conn = self.connector.connect(node).await?;
        Ok(spawn_listener(&self.ctx, Arc::new(conn), Direction::Outbound))
    }

    /// A running listener to `node`, connecting if there is none
    async fn listener_for(&self, node: &str) -> Result<Arc<Listener>> {
        let _serialised = self.outbound.lock().await;
        if let Some(listener) = self.ctx.registry.find_by_node(node) {
            debug!(listener = listener.id(), "Reusing listener to {}", node);
            return Ok(listener);
        }
        self.connect_outbound(node).await
    }

    /// Hand a call to a controller on `node`
    ///
    /// The handle resolves once the call is detached again.
    pub async fn attach_outbound(&self, uuid: &str, target: &AttachTarget, node: &str) -> Result<SessionHandle> {
        let listener = self.listener_for(node).await?;
        let session = match target {
            AttachTarget::Registered(name) => {
                session::reserve(&self.ctx, &listener, uuid, Some(ProcessAddress::Name(name.clone())))?
            }
            AttachTarget::Spawn(spawn) => session::attach_spawned(&self.ctx, &listener, uuid, spawn).await?,
        };
        info!(listener = listener.id(), uuid, "Attached call to {:?} on {}", target, node);
        Ok(session.handle())
    }

    /// Send `{freeswitch_sendmsg, Text}` to a registered process on `node`
    pub async fn send_message(&self, reg_name: &str, node: &str, text: &str) -> Result<()> {
        let listener = self.listener_for(node).await?;
        let message = Term::tuple(vec![
            Term::atom("freeswitch_sendmsg"),
            Term::text(text, listener.encoding()),
        ]);
        listener.connection().reg_send(reg_name, message).await
    }

    /// Fan an engine event out to every subscriber; never blocks
    pub fn publish(&self, event: &Event) {
        self.ctx.registry.publish_event(event);
    }

    /// Fan a log line out to every log receiver; never blocks
    pub fn log(&self, entry: &LogEntry) {
        self.ctx.registry.publish_log(entry);
    }

    /// Ask the process bound to the section for a document
    pub async fn fetch(&self, request: &FetchRequest) -> Option<String> {
        fetch::fetch(&self.ctx, request).await
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    /// Stop accepting, close every listener and wait briefly for them to go
    pub async fn shutdown(&self) {
        info!("Shutting down Erlang bridge");
        self.ctx.shutdown.cancel();
        for listener in self.ctx.registry.snapshot() {
            listener.shutdown();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.ctx.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.ctx.registry.is_empty() {
            warn!("{} listeners still closing after shutdown", self.ctx.registry.len());
        }
    }
}

pub(crate) fn spawn_listener(ctx: &Arc<BridgeContext>, conn: Arc<dyn NodeConnection>, direction: Direction) -> Arc<Listener> {
    let id = ctx.registry.next_id();
    let peer = conn.peer_node().to_string();
    let listener = Arc::new(Listener::new(id, conn, direction, &ctx.config));
    listener.set_state(ListenerState::Running);
    ctx.registry.add(listener.clone());

    let span = info_span!("listener", id, peer = %peer);
    tokio::spawn(main_loop::run(ctx.clone(), listener.clone()).instrument(span));
    listener
}

async fn accept_loop(ctx: Arc<BridgeContext>, admission: Arc<AdmissionPolicy>, acceptor: TcpNodeAcceptor) {
    loop {
        let pending = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = acceptor.accept() => match accepted {
                Ok(pending) => pending,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        let admission = admission.clone();
        tokio::spawn(async move {
            let addr = pending.remote_addr();
            let allowed = admission.allows(addr.ip());
            let conn = match pending.handshake().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Handshake with {} failed: {}", addr, e);
                    return;
                }
            };
            if !allowed {
                admission::reject(&conn, ctx.config.acl_drain_timeout()).await;
                return;
            }
            spawn_listener(&ctx, Arc::new(conn), Direction::Inbound);
        });
    }
    debug!("Accept loop stopped");
}
