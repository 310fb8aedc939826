//! Per-connection listener state
//!
//! A [`Listener`] is everything the bridge knows about one peer connection:
//! its queues, subscriptions, attached calls, receivers and the correlation
//! tables for replies arriving on it. Each piece is locked on its own so
//! fan-out from engine threads never waits for the listener's loop.

pub mod filter;
pub(crate) mod main_loop;
pub mod queue;
pub mod watch;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use strum::AsRefStr;
use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::correlation::{CorrelationTable, RetryTable};
use crate::event::{Event, LogEntry, LogLevel};
use crate::node::{NodeConnection, ProcessAddress};
use crate::session::Session;
use crate::term::{Pid, StringEncoding};

pub use filter::{EventSubscription, FilterAction};
pub use queue::{LossyQueue, PushOutcome};
pub use watch::{Watch, WatchTable};

pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerState {
    /// Connection accepted, not yet serving
    Admitted,
    Running,
    /// Flushing output before close
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug)]
struct Roles {
    events_enabled: bool,
    log_enabled: bool,
    log_level: LogLevel,
    event_receiver: Option<ProcessAddress>,
    log_receiver: Option<ProcessAddress>,
}

pub struct Listener {
    id: ListenerId,
    conn: Arc<dyn NodeConnection>,
    direction: Direction,
    encoding: StringEncoding,
    state: Mutex<ListenerState>,
    roles: Mutex<Roles>,
    subscription: Mutex<EventSubscription>,
    event_queue: LossyQueue<Event>,
    log_queue: LossyQueue<LogEntry>,
    sessions: Mutex<Vec<Arc<Session>>>,
    watches: Mutex<WatchTable>,
    spawn_replies: CorrelationTable<Pid>,
    retries: RetryTable,
    wake: Arc<Notify>,
    teardown: RwLock<()>,
    shutdown: CancellationToken,
    connected_at: Instant,
}

impl Listener {
    pub fn new(id: ListenerId, conn: Arc<dyn NodeConnection>, direction: Direction, config: &BridgeConfig) -> Self {
        let wake = Arc::new(Notify::new());
        Self {
            id,
            conn,
            direction,
            encoding: config.encoding,
            state: Mutex::new(ListenerState::Admitted),
            roles: Mutex::new(Roles {
                events_enabled: false,
                log_enabled: false,
                log_level: LogLevel::Debug,
                event_receiver: None,
                log_receiver: None,
            }),
            subscription: Mutex::new(EventSubscription::none()),
            event_queue: LossyQueue::new(config.event_queue_capacity, wake.clone()),
            log_queue: LossyQueue::new(config.log_queue_capacity, wake.clone()),
            sessions: Mutex::new(Vec::new()),
            watches: Mutex::new(WatchTable::default()),
            spawn_replies: CorrelationTable::new("spawn"),
            retries: RetryTable::new(config.bgapi_retry.clone()),
            wake,
            teardown: RwLock::new(()),
            shutdown: CancellationToken::new(),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn NodeConnection> {
        &self.conn
    }

    pub fn peer_node(&self) -> &str {
        self.conn.peer_node()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    pub fn self_pid(&self) -> &Pid {
        self.conn.self_pid()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn encoding(&self) -> StringEncoding {
        self.encoding
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ListenerState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(listener = self.id, "Listener {} -> {}", current.as_ref(), state.as_ref());
            *current = state;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ListenerState::Running
    }

    /// Ask the listener's loop to drain and close
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.wake.notify_one();
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }

    // Event and log roles

    pub fn events_enabled(&self) -> bool {
        self.roles.lock().events_enabled
    }

    /// Turn event delivery on, defaulting the receiver to `sender`
    pub fn enable_events(&self, sender: &Pid) {
        let mut roles = self.roles.lock();
        roles.events_enabled = true;
        if roles.event_receiver.is_none() {
            roles.event_receiver = Some(ProcessAddress::Pid(sender.clone()));
        }
    }

    pub fn set_event_receiver(&self, receiver: ProcessAddress) {
        let mut roles = self.roles.lock();
        roles.events_enabled = true;
        roles.event_receiver = Some(receiver);
    }

    pub fn event_receiver(&self) -> Option<ProcessAddress> {
        self.roles.lock().event_receiver.clone()
    }

    /// Stop event delivery and forget the subscription; false if it was off
    pub fn disable_events(&self) -> bool {
        self.event_queue.purge();
        let was_enabled = {
            let mut roles = self.roles.lock();
            let was_enabled = roles.events_enabled;
            roles.events_enabled = false;
            roles.event_receiver = None;
            was_enabled
        };
        self.subscription.lock().clear();
        was_enabled
    }

    pub fn log_enabled(&self) -> bool {
        self.roles.lock().log_enabled
    }

    pub fn log_level(&self) -> LogLevel {
        self.roles.lock().log_level
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.roles.lock().log_level = level;
    }

    /// Make `receiver` the log receiver; resets the level to debug
    pub fn set_log_receiver(&self, receiver: ProcessAddress) {
        let mut roles = self.roles.lock();
        roles.log_enabled = true;
        roles.log_level = LogLevel::Debug;
        roles.log_receiver = Some(receiver);
    }

    pub fn log_receiver(&self) -> Option<ProcessAddress> {
        self.roles.lock().log_receiver.clone()
    }

    pub fn disable_log(&self) {
        self.log_queue.purge();
        let mut roles = self.roles.lock();
        roles.log_enabled = false;
        roles.log_receiver = None;
    }

    pub fn with_subscription<R>(&self, f: impl FnOnce(&mut EventSubscription) -> R) -> R {
        f(&mut self.subscription.lock())
    }

    pub fn event_queue(&self) -> &LossyQueue<Event> {
        &self.event_queue
    }

    pub fn log_queue(&self) -> &LossyQueue<LogEntry> {
        &self.log_queue
    }

    // Sessions

    pub(crate) fn add_session(&self, session: Arc<Session>) {
        self.sessions.lock().push(session);
        self.wake.notify_one();
    }

    pub(crate) fn remove_session(&self, uuid: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let index = sessions.iter().position(|s| s.uuid() == uuid)?;
        Some(sessions.remove(index))
    }

    pub fn session(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().iter().find(|s| s.uuid() == uuid).cloned()
    }

    /// The session controlled by `pid`
    pub fn session_by_controller(&self, pid: &Pid) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.controller().as_ref() == Some(&ProcessAddress::Pid(pid.clone())))
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn take_sessions(&self) -> Vec<Arc<Session>> {
        std::mem::take(&mut *self.sessions.lock())
    }

    // Watches

    /// Record a watch; true when the pid still needs a link
    pub(crate) fn watch(&self, pid: &Pid, watch: Watch) -> bool {
        self.watches.lock().add(pid, watch)
    }

    pub(crate) fn unwatch(&self, pid: &Pid, watch: &Watch) {
        self.watches.lock().remove(pid, watch);
    }

    pub(crate) fn unwatch_everywhere(&self, watch: &Watch) {
        self.watches.lock().remove_everywhere(watch);
    }

    pub(crate) fn take_watches(&self, pid: &Pid) -> Vec<Watch> {
        self.watches.lock().take(pid)
    }

    // Correlation

    pub fn spawn_replies(&self) -> &CorrelationTable<Pid> {
        &self.spawn_replies
    }

    pub fn retries(&self) -> &RetryTable {
        &self.retries
    }

    // Teardown guard

    /// Held while work that needs the listener alive is running
    pub async fn hold(&self) -> RwLockReadGuard<'_, ()> {
        self.teardown.read().await
    }

    /// `None` once teardown has begun
    pub fn try_hold(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.teardown.try_read().ok()
    }

    pub(crate) async fn begin_teardown(&self) -> RwLockWriteGuard<'_, ()> {
        self.teardown.write().await
    }

    /// Whether the loop has something to write right now
    pub fn has_pending_output(&self) -> bool {
        let (log_enabled, events_enabled) = {
            let roles = self.roles.lock();
            (roles.log_enabled, roles.events_enabled)
        };
        (log_enabled && !self.log_queue.is_empty())
            || (events_enabled && !self.event_queue.is_empty())
            || self.sessions.lock().iter().any(|s| s.has_pending_output())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("peer_node", &self.peer_node())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::memory;

    fn listener() -> Listener {
        let (conn, _peer) = memory::pair(Pid::new("fs@host", 1, 0, 1), "peer@box");
        Listener::new(1, Arc::new(conn), Direction::Inbound, &BridgeConfig::default())
    }

    #[test]
    fn test_event_role_defaults_to_sender() {
        let l = listener();
        let sender = Pid::new("peer@box", 7, 0, 1);
        assert!(!l.events_enabled());
        l.enable_events(&sender);
        assert_eq!(l.event_receiver(), Some(ProcessAddress::Pid(sender)));

        l.with_subscription(|s| s.subscribe(["ALL"]));
        assert!(l.disable_events());
        assert!(!l.disable_events());
        assert!(l.with_subscription(|s| s.is_empty()));
        assert!(l.event_receiver().is_none());
    }

    #[test]
    fn test_log_receiver_resets_level() {
        let l = listener();
        l.set_log_level(LogLevel::Err);
        l.set_log_receiver(ProcessAddress::Name("logger".into()));
        assert!(l.log_enabled());
        assert_eq!(l.log_level(), LogLevel::Debug);
        l.disable_log();
        assert!(!l.log_enabled());
    }

    #[tokio::test]
    async fn test_teardown_excludes_holders() {
        let l = listener();
        let guard = l.try_hold();
        assert!(guard.is_some());
        drop(guard);

        let _write = l.begin_teardown().await;
        assert!(l.try_hold().is_none());
    }
}
