//! Calls attached to remote controllers
//!
//! A [`Session`] binds one call to one controller process and lives in
//! exactly one listener's session list. The process-wide attached-call index
//! refuses a second attachment of the same call until the first is detached.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::bridge::BridgeContext;
use crate::correlation::WaitOutcome;
use crate::error::{BridgeError, Result};
use crate::event::{Event, EventType};
use crate::listener::{EventSubscription, Listener, LossyQueue, Watch};
use crate::node::ProcessAddress;
use crate::term::{Pid, Term};

/// Initial channel state reported before the call sends any state change
const INITIAL_CHANNEL_STATE: &str = "CS_NEW";

/// How a spawned controller is asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnTarget {
    /// Ask the registered process `module` which pid should own the call
    GetPid { module: String },
    /// Call `module:function(Ref)` through `rex`
    Rpc { module: String, function: String },
}

/// Who should control an outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Registered(String),
    Spawn(SpawnTarget),
}

impl FromStr for AttachTarget {
    type Err = BridgeError;

    /// `name`, `module:function` or `module:!`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once(':') {
            None if !s.is_empty() => Ok(AttachTarget::Registered(s.to_string())),
            Some((module, "!")) if !module.is_empty() => Ok(AttachTarget::Spawn(SpawnTarget::GetPid {
                module: module.to_string(),
            })),
            Some((module, function)) if !module.is_empty() && !function.is_empty() => {
                Ok(AttachTarget::Spawn(SpawnTarget::Rpc {
                    module: module.to_string(),
                    function: function.to_string(),
                }))
            }
            _ => Err(BridgeError::invalid_argument(format!("invalid attach target '{}'", s))),
        }
    }
}

/// Why an attach request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachRefusal {
    BadUuid,
    NoSuchCall,
    AlreadyControlled,
}

impl AttachRefusal {
    pub fn reason(self) -> &'static str {
        match self {
            AttachRefusal::BadUuid => "baduuid",
            AttachRefusal::NoSuchCall => "badsession",
            AttachRefusal::AlreadyControlled => "session_attach_failed",
        }
    }
}

impl From<AttachRefusal> for BridgeError {
    fn from(refusal: AttachRefusal) -> Self {
        match refusal {
            AttachRefusal::BadUuid => BridgeError::invalid_argument("empty call uuid"),
            AttachRefusal::NoSuchCall => BridgeError::not_found("no such call"),
            AttachRefusal::AlreadyControlled => BridgeError::engine("call is already controlled"),
        }
    }
}

pub struct Session {
    uuid: String,
    /// `None` while waiting for a spawned controller
    controller: Mutex<Option<ProcessAddress>>,
    queue: LossyQueue<Event>,
    filter: Mutex<EventSubscription>,
    initialized: AtomicBool,
    complete: AtomicBool,
    channel_state: Mutex<String>,
    wake: Arc<Notify>,
    detached: watch::Sender<bool>,
}

impl Session {
    pub fn new(uuid: &str, controller: Option<ProcessAddress>, capacity: usize, wake: Arc<Notify>) -> Self {
        let (detached, _) = watch::channel(false);
        Self {
            uuid: uuid.to_string(),
            controller: Mutex::new(controller),
            queue: LossyQueue::new(capacity, wake.clone()),
            filter: Mutex::new(EventSubscription::all()),
            initialized: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            channel_state: Mutex::new(INITIAL_CHANNEL_STATE.to_string()),
            wake,
            detached,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn controller(&self) -> Option<ProcessAddress> {
        self.controller.lock().clone()
    }

    pub(crate) fn set_controller(&self, controller: ProcessAddress) {
        *self.controller.lock() = Some(controller);
        self.wake.notify_one();
    }

    pub fn is_waiting_for_controller(&self) -> bool {
        self.controller.lock().is_none()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// The call reached its terminal state
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Last channel state seen on the call
    pub fn channel_state(&self) -> String {
        self.channel_state.lock().clone()
    }

    pub fn with_filter<R>(&self, f: impl FnOnce(&mut EventSubscription) -> R) -> R {
        f(&mut self.filter.lock())
    }

    /// Queue an event of this call for the controller
    ///
    /// `CHANNEL_DESTROY` marks the session complete whether or not the
    /// session filter lets it through.
    pub fn offer(&self, event: &Event) {
        if let Some(state) = event.header("Channel-State") {
            *self.channel_state.lock() = state.to_string();
        }

        if self.filter.lock().should_deliver(event) {
            self.queue.push(event.clone(), lost_session_events);
        }

        if event.event_type() == EventType::ChannelDestroy {
            self.complete.store(true, Ordering::Release);
            self.wake.notify_one();
        }
    }

    pub(crate) fn pop_event(&self) -> Option<Event> {
        self.queue.pop()
    }

    pub(crate) fn purge_events(&self) -> usize {
        self.queue.purge()
    }

    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.is_waiting_for_controller() && (!self.is_initialized() || self.is_complete() || !self.queue.is_empty())
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.send_replace(true);
    }

    pub fn is_detached(&self) -> bool {
        *self.detached.borrow()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            uuid: self.uuid.clone(),
            detached: self.detached.subscribe(),
        }
    }
}

fn lost_session_events(lost: u64) -> Event {
    Event::new(EventType::Trap).with_header("info", format!("lost {} events", lost))
}

/// Observer of one attached call
#[derive(Debug, Clone)]
pub struct SessionHandle {
    uuid: String,
    detached: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_detached(&self) -> bool {
        *self.detached.borrow()
    }

    /// Resolve once the call is no longer attached
    pub async fn wait_detached(&mut self) {
        // A dropped sender means the session is gone too
        let _ = self.detached.wait_for(|detached| *detached).await;
    }
}

/// Attach `uuid` to `listener`, refusing unknown or already controlled calls
pub(crate) fn reserve(
    ctx: &BridgeContext,
    listener: &Listener,
    uuid: &str,
    controller: Option<ProcessAddress>,
) -> std::result::Result<Arc<Session>, AttachRefusal> {
    if uuid.is_empty() {
        return Err(AttachRefusal::BadUuid);
    }
    if ctx.engine.call_data(uuid).is_none() {
        return Err(AttachRefusal::NoSuchCall);
    }

    match ctx.attached.entry(uuid.to_string()) {
        Entry::Occupied(owner) => {
            debug!(uuid, "Call already attached to listener {}", owner.get());
            return Err(AttachRefusal::AlreadyControlled);
        }
        Entry::Vacant(slot) => {
            slot.insert(listener.id());
        }
    }

    let session = Arc::new(Session::new(
        uuid,
        controller,
        ctx.config.session_queue_capacity,
        listener.wake().clone(),
    ));
    listener.add_session(session.clone());
    ctx.engine.set_call_controlled(uuid, true);
    Ok(session)
}

/// Unlink a session from its listener and hand the call back to the engine
pub(crate) fn detach(ctx: &BridgeContext, listener: &Listener, uuid: &str, reason: &str) -> Option<Arc<Session>> {
    let session = listener.remove_session(uuid)?;
    ctx.attached.remove_if(uuid, |_, owner| *owner == listener.id());
    listener.unwatch_everywhere(&Watch::Session(uuid.to_string()));
    ctx.engine.set_call_controlled(uuid, false);
    session.purge_events();
    session.mark_detached();
    debug!(listener = listener.id(), uuid, "Detached session: {}", reason);
    Some(session)
}

/// Attach a call to a controller nominated by the peer
///
/// The session sits in the listener's list without a controller until the
/// peer answers; without an answer in time the attachment is torn down.
pub(crate) async fn attach_spawned(
    ctx: &BridgeContext,
    listener: &Arc<Listener>,
    uuid: &str,
    target: &SpawnTarget,
) -> Result<Arc<Session>> {
    let session = reserve(ctx, listener, uuid, None)?;
    let reference = ctx.refs.next_ref();
    let pending = match listener.spawn_replies().register(reference.hash_key()) {
        Ok(pending) => pending,
        Err(e) => {
            detach(ctx, listener, uuid, "listener closing");
            return Err(e);
        }
    };

    let encoding = listener.encoding();
    let self_pid = Term::Pid(listener.self_pid().clone());
    let (to, request) = match target {
        SpawnTarget::GetPid { module } => (
            module.as_str(),
            Term::tuple(vec![
                Term::atom("get_pid"),
                Term::text(uuid, encoding),
                Term::Ref(reference.clone()),
                self_pid,
            ]),
        ),
        SpawnTarget::Rpc { module, function } => (
            "rex",
            Term::tuple(vec![
                self_pid,
                Term::tuple(vec![
                    Term::atom("call"),
                    Term::atom(module.as_str()),
                    Term::atom(function.as_str()),
                    Term::list(vec![Term::Ref(reference.clone())]),
                    Term::atom("user"),
                ]),
            ]),
        ),
    };

    if let Err(e) = listener.connection().reg_send(to, request).await {
        detach(ctx, listener, uuid, "spawn request failed");
        return Err(e);
    }

    match listener.spawn_replies().wait(pending, ctx.config.spawn_timeout()).await {
        WaitOutcome::Found(pid) => {
            adopt_controller(ctx, listener, &session, pid).await?;
            Ok(session)
        }
        WaitOutcome::TimedOut | WaitOutcome::Aborted => {
            detach(ctx, listener, uuid, "no controller pid");
            Err(BridgeError::timeout(format!("no controller for {} from {}", uuid, listener.peer_node())))
        }
    }
}

/// Give a waiting session the controller its peer nominated
///
/// Fails when the session was detached while the answer was in flight, for
/// instance by the listener closing.
pub(crate) async fn adopt_controller(ctx: &BridgeContext, listener: &Listener, session: &Arc<Session>, pid: Pid) -> Result<()> {
    let uuid = session.uuid();
    if !still_attached(ctx, listener, session) {
        return Err(BridgeError::closed(format!("call {} detached before {} took control", uuid, pid)));
    }

    let watch = Watch::Session(uuid.to_string());
    if listener.watch(&pid, watch.clone()) {
        if let Err(e) = listener.connection().link(&pid).await {
            warn!(uuid, "Failed to link controller {}: {}", pid, e);
        }
    }
    session.set_controller(ProcessAddress::Pid(pid.clone()));

    // The link above can yield to a closing listener
    if !still_attached(ctx, listener, session) {
        listener.unwatch(&pid, &watch);
        return Err(BridgeError::closed(format!("call {} detached before {} took control", uuid, pid)));
    }
    info!(listener = listener.id(), uuid, "Call controlled by {}", pid);
    Ok(())
}

fn still_attached(ctx: &BridgeContext, listener: &Listener, session: &Arc<Session>) -> bool {
    !session.is_detached()
        && ctx.attached.get(session.uuid()).is_some_and(|owner| *owner == listener.id())
        && listener
            .session(session.uuid())
            .is_some_and(|current| Arc::ptr_eq(&current, session))
}
