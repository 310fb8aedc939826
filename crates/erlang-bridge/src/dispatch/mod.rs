//! Routing peer messages to handlers
//!
//! Handlers are registered once per bridge in two tables, one for
//! atom-tagged tuples and one for bare atoms. A handler only inspects state
//! and returns an [`Outcome`]; the dispatcher then performs the wire effects
//! (links, replies, commands) in order.

mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::bridge::BridgeContext;
use crate::correlation::ResolveOutcome;
use crate::listener::Listener;
use crate::node::ControlMessage;
use crate::term::{Pid, Term};

/// Everything a handler may look at
pub struct MessageContext<'a> {
    pub ctx: &'a BridgeContext,
    pub listener: &'a Arc<Listener>,
    /// Sender of the message
    pub from: &'a Pid,
}

/// What to do after a handler ran
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    NoReply,
    /// Reply to the sender
    Reply(Term),
    /// Message to some other pid
    ReplyTo(Pid, Term),
    /// Link to the pid, then reply to the sender if a reply is given
    Link(Pid, Option<Term>),
    /// Run a command inline and reply with its result
    Api { command: String, arg: String },
    /// Reply with a job id, then run the command in the background
    Background { command: String, arg: String },
    /// Reply, then end the listener
    Exit(Term),
}

impl Outcome {
    pub fn ok() -> Self {
        Outcome::Reply(Term::ok())
    }

    pub fn error(reason: &str) -> Self {
        Outcome::Reply(Term::error(reason))
    }

    pub fn badarg() -> Self {
        Self::error("badarg")
    }
}

/// Whether the listener keeps running after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Handler for one tag; `args` excludes the tag itself
pub type Handler = fn(&MessageContext<'_>, &[Term]) -> Outcome;

pub struct Dispatcher {
    tagged: HashMap<&'static str, Handler>,
    atoms: HashMap<&'static str, Handler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// A dispatcher with the full message vocabulary
    pub fn new() -> Self {
        let mut dispatcher = Self::empty();
        handlers::register(&mut dispatcher);
        dispatcher
    }

    pub fn empty() -> Self {
        Self {
            tagged: HashMap::new(),
            atoms: HashMap::new(),
        }
    }

    pub fn register_tagged(&mut self, tag: &'static str, handler: Handler) {
        self.tagged.insert(tag, handler);
    }

    pub fn register_atom(&mut self, atom: &'static str, handler: Handler) {
        self.atoms.insert(atom, handler);
    }

    pub fn handles_tag(&self, tag: &str) -> bool {
        self.tagged.contains_key(tag)
    }

    /// Decide what a message calls for without touching the wire
    pub fn route(&self, mc: &MessageContext<'_>, message: &ControlMessage) -> Outcome {
        match message {
            ControlMessage::RegSend { to_name, message, .. } if to_name == "net_kernel" => net_kernel(message),
            ControlMessage::Send { message, .. } | ControlMessage::RegSend { message, .. } => self.route_term(mc, message),
            // Links and exits are the main loop's business
            _ => Outcome::NoReply,
        }
    }

    fn route_term(&self, mc: &MessageContext<'_>, message: &Term) -> Outcome {
        match message {
            Term::Tuple(items) => match items.first() {
                Some(Term::Atom(tag)) => match self.tagged.get(tag.as_str()) {
                    Some(handler) => handler(mc, &items[1..]),
                    None => {
                        debug!(listener = mc.listener.id(), "No handler for tag {}", tag);
                        Outcome::error("undef")
                    }
                },
                Some(Term::Ref(_)) => spawn_reply(mc, items),
                _ => Outcome::error("undef"),
            },
            Term::Atom(atom) => match self.atoms.get(atom.as_str()) {
                Some(handler) => handler(mc, &[]),
                None => Outcome::error("undef"),
            },
            _ => Outcome::error("undef"),
        }
    }

    /// Route a message and carry out its effects
    pub async fn dispatch(&self, mc: &MessageContext<'_>, message: &ControlMessage) -> Flow {
        let outcome = self.route(mc, message);
        trace!(listener = mc.listener.id(), "{:?} -> {:?}", message, outcome);
        perform(mc, outcome).await
    }
}

async fn perform(mc: &MessageContext<'_>, outcome: Outcome) -> Flow {
    let listener = mc.listener;
    let conn = listener.connection();
    let result = match outcome {
        Outcome::NoReply => Ok(()),
        Outcome::Reply(reply) => conn.send_to(mc.from, reply).await,
        Outcome::ReplyTo(pid, reply) => conn.send_to(&pid, reply).await,
        Outcome::Link(pid, reply) => {
            let linked = conn.link(&pid).await;
            match (linked, reply) {
                (Ok(()), Some(reply)) => conn.send_to(mc.from, reply).await,
                (linked, _) => linked,
            }
        }
        Outcome::Api { command, arg } => {
            let _hold = listener.hold().await;
            let result = mc.ctx.commands.run_api(&command, &arg).await;
            conn.send_to(mc.from, result.to_term(listener.encoding())).await
        }
        Outcome::Background { command, arg } => {
            let job_id = mc.ctx.commands.new_job_id();
            let reply = Term::ok_with(Term::text(job_id.as_str(), listener.encoding()));
            let sent = conn.send_to(mc.from, reply).await;
            if sent.is_ok() {
                mc.ctx
                    .commands
                    .spawn_background(listener.clone(), mc.from.clone(), &job_id, &command, &arg);
            }
            sent
        }
        Outcome::Exit(reply) => {
            if let Err(e) = conn.send_to(mc.from, reply).await {
                debug!(listener = listener.id(), "Could not confirm exit: {}", e);
            }
            return Flow::Stop;
        }
    };

    if let Err(e) = result {
        warn!(listener = listener.id(), "Failed to answer {}: {}", mc.from, e);
        if e.is_fatal() {
            return Flow::Stop;
        }
    }
    Flow::Continue
}

/// `{'$gen_call', {Pid, Ref}, {is_auth, Node}}` as sent by `net_adm:ping`
fn net_kernel(message: &Term) -> Outcome {
    let Some([call, from, request]) = message.as_tuple() else {
        return Outcome::NoReply;
    };
    if !call.is_atom("$gen_call") {
        return Outcome::NoReply;
    }
    let Some([Term::Pid(pid), reference @ Term::Ref(_)]) = from.as_tuple() else {
        return Outcome::NoReply;
    };
    match request.as_tuple() {
        Some([is_auth, _node]) if is_auth.is_atom("is_auth") => {
            Outcome::ReplyTo(pid.clone(), Term::tuple(vec![reference.clone(), Term::atom("yes")]))
        }
        _ => Outcome::NoReply,
    }
}

/// `{Ref, Pid}` naming the controller of a spawned attachment
fn spawn_reply(mc: &MessageContext<'_>, items: &[Term]) -> Outcome {
    let (Some(reference), Some(pid)) = (items.first().and_then(Term::as_ref), items.get(1).and_then(Term::as_pid))
    else {
        warn!(listener = mc.listener.id(), "Invalid pid in a reference/pid tuple");
        return Outcome::NoReply;
    };

    let key = reference.hash_key();
    match mc.listener.spawn_replies().resolve(&key, pid.clone()) {
        ResolveOutcome::Resolved => {
            debug!(listener = mc.listener.id(), "Found waiting slot for {}", key);
            Outcome::NoReply
        }
        ResolveOutcome::TimedOut => Outcome::error("timeout"),
        ResolveOutcome::Duplicate => Outcome::error("duplicate_response"),
        ResolveOutcome::Unknown => Outcome::error("invalid_ref"),
    }
}
