//! The per-listener task
//!
//! One task per connection: receive a message (or wait for queued output),
//! dispatch it, then write at most one log line, one event and one step of
//! every attached call. When the peer goes away, asks to exit, or the bridge
//! shuts down, the loop drains what it can and tears the listener down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::bridge::BridgeContext;
use crate::dispatch::{Flow, MessageContext};
use crate::error::Result;
use crate::listener::{Listener, ListenerState, Watch};
use crate::node::{ControlMessage, ProcessAddress};
use crate::session;
use crate::term::{Pid, Term};

/// How long a timed-out correlation entry is kept to recognise late replies
const TOMBSTONE_GRACE: Duration = Duration::from_secs(60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on writes while draining
const DRAIN_LIMIT: usize = 10_000;

pub(crate) async fn run(ctx: Arc<BridgeContext>, listener: Arc<Listener>) {
    listener.set_state(ListenerState::Running);
    info!(
        listener = listener.id(),
        "Serving {} {} ({})",
        listener.direction().as_ref(),
        listener.peer_node(),
        listener
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "local".to_string())
    );

    let reason = serve(&ctx, &listener).await;
    debug!(listener = listener.id(), "Loop ended: {}", reason);

    listener.set_state(ListenerState::Draining);
    drain(&ctx, &listener).await;
    close(&ctx, &listener).await;
}

async fn serve(ctx: &Arc<BridgeContext>, listener: &Arc<Listener>) -> &'static str {
    let conn = listener.connection().clone();
    let poll = ctx.config.poll_interval();
    let mut last_prune = Instant::now();

    loop {
        // Queued output shortens the wait to a single poll of the socket
        let timeout = if listener.has_pending_output() { Duration::ZERO } else { poll };

        let received = tokio::select! {
            biased;
            _ = listener.shutdown_token().cancelled() => return "shutdown requested",
            _ = ctx.shutdown.cancelled() => return "bridge shutting down",
            received = conn.receive(timeout) => Some(received),
            _ = listener.wake().notified(), if timeout > Duration::ZERO => None,
        };

        match received {
            Some(Ok(Some(message))) => {
                if handle_message(ctx, listener, message).await == Flow::Stop {
                    return "exit requested";
                }
            }
            Some(Ok(None)) | None => {}
            Some(Err(e)) if e.is_fatal() => {
                info!(listener = listener.id(), "Connection to {} lost: {}", listener.peer_node(), e);
                return "connection lost";
            }
            Some(Err(e)) => warn!(listener = listener.id(), "Dropped undecodable message: {}", e),
        }

        if let Err(e) = housekeeping(ctx, listener).await {
            info!(listener = listener.id(), "Write to {} failed: {}", listener.peer_node(), e);
            return "write failed";
        }

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            ctx.fetches.prune(TOMBSTONE_GRACE);
            listener.spawn_replies().prune(TOMBSTONE_GRACE);
            last_prune = Instant::now();
        }
    }
}

async fn handle_message(ctx: &Arc<BridgeContext>, listener: &Arc<Listener>, message: ControlMessage) -> Flow {
    match &message {
        ControlMessage::Exit { from, reason, .. } => {
            debug!(listener = listener.id(), "{} exited: {}", from, reason);
            handle_exit(ctx, listener, from);
            Flow::Continue
        }
        ControlMessage::Unlink { from, .. } => {
            handle_exit(ctx, listener, from);
            Flow::Continue
        }
        ControlMessage::Link { from, .. } => {
            trace!(listener = listener.id(), "Linked by {}", from);
            Flow::Continue
        }
        ControlMessage::Send { from, .. } | ControlMessage::RegSend { from, .. } => {
            let mc = MessageContext {
                ctx,
                listener,
                from,
            };
            ctx.dispatcher.dispatch(&mc, &message).await
        }
    }
}

/// Undo every role `pid` held on this listener
pub(crate) fn handle_exit(ctx: &BridgeContext, listener: &Listener, pid: &Pid) {
    let as_address = ProcessAddress::Pid(pid.clone());
    for watch in listener.take_watches(pid) {
        match watch {
            Watch::LogReceiver => {
                if listener.log_receiver().as_ref() == Some(&as_address) {
                    debug!(listener = listener.id(), "Log receiver {} gone", pid);
                    listener.disable_log();
                }
            }
            Watch::EventReceiver => {
                if listener.event_receiver().as_ref() == Some(&as_address) {
                    debug!(listener = listener.id(), "Event receiver {} gone", pid);
                    listener.disable_events();
                }
            }
            Watch::Session(uuid) => {
                session::detach(ctx, listener, &uuid, "controller exited");
            }
            Watch::FetchBinding(section) => {
                ctx.bindings.unbind(listener.id(), pid, section);
            }
        }
    }
}

/// Write one pending item of each kind; errors only when the connection is unusable
async fn housekeeping(ctx: &BridgeContext, listener: &Listener) -> Result<()> {
    let encoding = listener.encoding();

    if listener.log_enabled() {
        if let Some(entry) = listener.log_queue().pop() {
            if let Some(to) = listener.log_receiver() {
                deliver(listener, &to, entry.to_term(encoding)).await?;
            }
        }
    }

    if listener.events_enabled() {
        if let Some(event) = listener.event_queue().pop() {
            if let Some(to) = listener.event_receiver() {
                deliver(listener, &to, event.to_term(encoding)).await?;
            }
        }
    }

    step_sessions(ctx, listener).await?;

    for (to, message) in listener.retries().due(Instant::now()) {
        deliver(listener, &to, message).await?;
    }
    Ok(())
}

/// Advance every attached call by one notification
async fn step_sessions(ctx: &BridgeContext, listener: &Listener) -> Result<()> {
    let encoding = listener.encoding();

    for session in listener.sessions() {
        let Some(controller) = session.controller() else {
            continue;
        };

        if !session.is_initialized() {
            match ctx.engine.call_data(session.uuid()) {
                Some(data) => {
                    let call = Term::tuple(vec![Term::atom("call"), data.to_term(encoding)]);
                    deliver(listener, &controller, call).await?;
                    session.mark_initialized();
                }
                None => {
                    session::detach(ctx, listener, session.uuid(), "call is gone");
                }
            }
        } else if session.is_complete() {
            while let Some(event) = session.pop_event() {
                deliver(listener, &controller, event.to_tagged_term("call_event", encoding)).await?;
            }
            deliver(listener, &controller, Term::atom("call_hangup")).await?;
            session::detach(ctx, listener, session.uuid(), "call ended");
        } else if let Some(event) = session.pop_event() {
            deliver(listener, &controller, event.to_tagged_term("call_event", encoding)).await?;
        }
    }
    Ok(())
}

async fn deliver(listener: &Listener, to: &ProcessAddress, message: Term) -> Result<()> {
    match listener.connection().send_to_address(to, message).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(listener = listener.id(), "Failed to send to {}: {}", to, e);
            Ok(())
        }
    }
}

/// Best-effort flush of queued output
async fn drain(ctx: &BridgeContext, listener: &Listener) {
    for _ in 0..DRAIN_LIMIT {
        if !listener.has_pending_output() {
            return;
        }
        if housekeeping(ctx, listener).await.is_err() {
            debug!(listener = listener.id(), "Connection gone while draining");
            return;
        }
    }
    debug!(listener = listener.id(), "Stopped draining with output left");
}

async fn close(ctx: &BridgeContext, listener: &Arc<Listener>) {
    let _teardown = listener.begin_teardown().await;

    let aborted = ctx.fetches.release_listener(listener.id()) + listener.spawn_replies().abort_all();
    if aborted > 0 {
        debug!(listener = listener.id(), "Released {} waiting callers", aborted);
    }
    listener.retries().clear();

    for session in listener.sessions() {
        session::detach(ctx, listener, session.uuid(), "listener closed");
    }
    ctx.bindings.remove_listener(listener.id());
    listener.disable_log();
    listener.disable_events();

    ctx.registry.remove(listener.id());
    listener.connection().close().await;
    listener.set_state(ListenerState::Closed);
    info!(listener = listener.id(), "Closed connection to {}", listener.peer_node());
}
