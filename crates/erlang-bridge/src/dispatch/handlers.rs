//! The message vocabulary

use tracing::{debug, info};

use super::{Dispatcher, MessageContext, Outcome};
use crate::correlation::ResolveOutcome;
use crate::event::{Event, EventType, LogLevel};
use crate::fetch::XmlSection;
use crate::listener::{EventSubscription, FilterAction, Watch};
use crate::node::ProcessAddress;
use crate::session;
use crate::term::{StringEncoding, Term};

pub(super) fn register(d: &mut Dispatcher) {
    d.register_tagged("event", event);
    d.register_tagged("nixevent", nixevent);
    d.register_tagged("setevent", setevent);
    d.register_tagged("session_event", session_event);
    d.register_tagged("session_nixevent", session_nixevent);
    d.register_tagged("session_setevent", session_setevent);
    d.register_tagged("filter", filter);
    d.register_tagged("set_log_level", set_log_level);
    d.register_tagged("api", api);
    d.register_tagged("bgapi", bgapi);
    d.register_tagged("sendevent", sendevent);
    d.register_tagged("sendmsg", sendmsg);
    d.register_tagged("bind", bind);
    d.register_tagged("handlecall", handlecall);
    d.register_tagged("fetch_reply", fetch_reply);
    d.register_tagged("rex", rex);
    d.register_tagged("ack", ack);

    d.register_atom("nolog", nolog);
    d.register_atom("register_log_handler", register_log_handler);
    d.register_atom("register_event_handler", register_event_handler);
    d.register_atom("noevents", noevents);
    d.register_atom("session_noevents", session_noevents);
    d.register_atom("exit", exit);
    d.register_atom("getpid", getpid);
    d.register_atom("link", link);
}

/// Names given flat (`{event, A, B}`) or as one list (`{event, [A, B]}`)
fn event_names(args: &[Term]) -> Option<Vec<String>> {
    let items = match args {
        [single] => single.as_list().unwrap_or(args),
        _ => args,
    };
    let names = items.iter().map(Term::as_name).collect::<Option<Vec<_>>>()?;
    (!names.is_empty()).then_some(names)
}

/// `[{Name, Value}, ...]`
fn header_list(term: &Term) -> Option<Vec<(String, String)>> {
    term.as_list()?
        .iter()
        .map(|item| match item.as_tuple()? {
            [name, value] => Some((name.as_text()?, value.as_text()?)),
            _ => None,
        })
        .collect()
}

fn event(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let Some(names) = event_names(args) else {
        return Outcome::badarg();
    };
    mc.listener.enable_events(mc.from);
    mc.listener.with_subscription(|s| s.subscribe(names.iter().map(String::as_str)));
    debug!(listener = mc.listener.id(), "Enabled events {:?}", names);
    Outcome::ok()
}

fn nixevent(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let Some(names) = event_names(args) else {
        return Outcome::badarg();
    };
    mc.listener.with_subscription(|s| s.unsubscribe(names.iter().map(String::as_str)));
    Outcome::ok()
}

fn setevent(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let Some(names) = event_names(args) else {
        return Outcome::badarg();
    };
    mc.listener.enable_events(mc.from);
    mc.listener.with_subscription(|s| s.replace(names.iter().map(String::as_str)));
    Outcome::ok()
}

fn session_event(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    with_controlled_session(mc, args, |filter, names| filter.subscribe(names.iter().copied()))
}

fn session_nixevent(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    with_controlled_session(mc, args, |filter, names| filter.unsubscribe(names.iter().copied()))
}

fn session_setevent(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    with_controlled_session(mc, args, |filter, names| filter.replace(names.iter().copied()))
}

/// Apply `change` to the filter of the session the sender controls
fn with_controlled_session(
    mc: &MessageContext<'_>,
    args: &[Term],
    change: impl FnOnce(&mut EventSubscription, &[&str]),
) -> Outcome {
    let Some(names) = event_names(args) else {
        return Outcome::badarg();
    };
    let Some(session) = mc.listener.session_by_controller(mc.from) else {
        return Outcome::error("nosession");
    };
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    session.with_filter(|filter| change(filter, &names));
    Outcome::ok()
}

enum FilterOp {
    Add(String, String),
    Delete(String, Option<String>),
    DeleteAll,
}

fn filter_op(term: &Term) -> Option<FilterOp> {
    if term.is_atom("delete_all") {
        return Some(FilterOp::DeleteAll);
    }
    match term.as_tuple()? {
        [op, header, value] if op.is_atom("add") => Some(FilterOp::Add(header.as_name()?, value.as_name()?)),
        [op, header, value] if op.is_atom("delete") => Some(FilterOp::Delete(header.as_name()?, Some(value.as_name()?))),
        [op, header] if op.is_atom("delete") => match header.as_name()? {
            all if all == "all" => Some(FilterOp::DeleteAll),
            header => Some(FilterOp::Delete(header, None)),
        },
        _ => None,
    }
}

fn filter_action_term(action: &FilterAction, encoding: StringEncoding) -> Term {
    match action {
        FilterAction::Added(h, v) => Term::tuple(vec![
            Term::atom("added"),
            Term::text(h.as_str(), encoding),
            Term::text(v.as_str(), encoding),
        ]),
        FilterAction::Deleted(h, Some(v)) => Term::tuple(vec![
            Term::atom("deleted"),
            Term::text(h.as_str(), encoding),
            Term::text(v.as_str(), encoding),
        ]),
        FilterAction::Deleted(h, None) => Term::tuple(vec![Term::atom("deleted"), Term::text(h.as_str(), encoding)]),
    }
}

fn filter(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let items = match args {
        [single] => single.as_list().unwrap_or(args),
        _ => args,
    };
    let Some(ops) = items.iter().map(filter_op).collect::<Option<Vec<_>>>() else {
        return Outcome::badarg();
    };
    let encoding = mc.listener.encoding();

    if ops.is_empty() {
        let current = mc.listener.with_subscription(|s| s.header_filters().to_vec());
        let listed = current
            .iter()
            .map(|(h, v)| Term::tuple(vec![Term::text(h.as_str(), encoding), Term::text(v.as_str(), encoding)]))
            .collect();
        return Outcome::Reply(Term::ok_with(Term::list(listed)));
    }

    let actions: Vec<FilterAction> = mc.listener.with_subscription(|s| {
        ops.iter()
            .map(|op| match op {
                FilterOp::Add(h, v) => s.add_header_filter(h, v),
                FilterOp::Delete(h, v) => s.delete_header_filter(h, v.as_deref()),
                FilterOp::DeleteAll => s.clear_header_filters(),
            })
            .collect()
    });
    let echoed = actions.iter().map(|a| filter_action_term(a, encoding)).collect();
    Outcome::Reply(Term::ok_with(Term::list(echoed)))
}

fn set_log_level(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let [level] = args else {
        return Outcome::badarg();
    };
    match level.as_atom().map(str::parse::<LogLevel>) {
        Some(Ok(level)) => {
            mc.listener.set_log_level(level);
            Outcome::ok()
        }
        _ => Outcome::badarg(),
    }
}

fn command_args(args: &[Term]) -> Option<(String, String)> {
    match args {
        [command, arg, ..] => Some((command.as_name()?, arg.as_text()?)),
        _ => None,
    }
}

fn api(_mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    match command_args(args) {
        Some((command, arg)) => Outcome::Api { command, arg },
        None => Outcome::badarg(),
    }
}

fn bgapi(_mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    match command_args(args) {
        Some((command, arg)) => Outcome::Background { command, arg },
        None => Outcome::badarg(),
    }
}

/// `{sendevent, Name, Headers}` or `{sendevent, 'CUSTOM', Subclass, Headers}`
fn sendevent(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let Some(event_type) = args
        .first()
        .and_then(Term::as_name)
        .and_then(|name| name.parse::<EventType>().ok())
        .filter(|t| *t != EventType::All)
    else {
        return Outcome::badarg();
    };

    let (mut event, headers) = match (event_type, &args[1..]) {
        (EventType::Custom, [subclass, headers]) => match subclass.as_name() {
            Some(subclass) => (Event::custom(subclass), headers),
            None => return Outcome::badarg(),
        },
        (EventType::Custom, _) => return Outcome::badarg(),
        (event_type, [headers]) => (Event::new(event_type), headers),
        _ => return Outcome::badarg(),
    };
    let Some(headers) = header_list(headers) else {
        return Outcome::badarg();
    };
    for (name, value) in headers {
        event.add_header(name, value);
    }

    debug!(listener = mc.listener.id(), "Firing {} from {}", event_type, mc.from);
    mc.ctx.engine.fire_event(event);
    Outcome::ok()
}

fn sendmsg(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let [uuid, headers] = args else {
        return Outcome::badarg();
    };
    let (Some(uuid), Some(headers)) = (uuid.as_text(), header_list(headers)) else {
        return Outcome::badarg();
    };
    if uuid.is_empty() || mc.ctx.engine.call_data(&uuid).is_none() {
        return Outcome::error("nosession");
    }

    let mut message = Event::new(EventType::SendMessage);
    for (name, value) in headers {
        message.add_header(name, value);
    }
    if mc.ctx.engine.queue_call_message(&uuid, message) {
        Outcome::ok()
    } else {
        Outcome::error("badmem")
    }
}

fn bind(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let Some(section) = (match args {
        [section] => section.as_name().and_then(|s| s.parse::<XmlSection>().ok()),
        _ => None,
    }) else {
        return Outcome::badarg();
    };

    mc.ctx.bindings.bind(mc.listener.id(), mc.from, section);
    mc.listener.watch(mc.from, Watch::FetchBinding(section));
    Outcome::Link(mc.from.clone(), Some(Term::ok()))
}

/// `{handlecall, UUID}` or `{handlecall, UUID, RegisteredName}`
fn handlecall(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let (uuid, name) = match args {
        [uuid] => (uuid, None),
        // The name is the atom, whichever side it was put on
        [a, b] => match (a.as_atom(), b.as_atom()) {
            (None, Some(name)) => (a, Some(name)),
            (Some(name), None) => (b, Some(name)),
            _ => return Outcome::badarg(),
        },
        _ => return Outcome::badarg(),
    };
    let Some(uuid) = uuid.as_text() else {
        return Outcome::badarg();
    };

    let controller = match name {
        Some(name) => ProcessAddress::Name(name.to_string()),
        None => ProcessAddress::Pid(mc.from.clone()),
    };
    if let Err(refusal) = session::reserve(mc.ctx, mc.listener, &uuid, Some(controller.clone())) {
        debug!(listener = mc.listener.id(), uuid = %uuid, "handlecall refused: {}", refusal.reason());
        return Outcome::error(refusal.reason());
    }
    info!(listener = mc.listener.id(), uuid = %uuid, "Call controlled by {}", controller);

    match controller {
        ProcessAddress::Pid(pid) => {
            mc.listener.watch(&pid, Watch::Session(uuid));
            Outcome::Link(pid, Some(Term::ok()))
        }
        ProcessAddress::Name(_) => Outcome::ok(),
    }
}

/// `{fetch_reply, UUID, Xml}`
fn fetch_reply(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let [uuid, xml, ..] = args else {
        return Outcome::badarg();
    };
    let (Some(uuid), Some(xml)) = (uuid.as_text(), xml.as_text()) else {
        return Outcome::badarg();
    };

    match mc.ctx.fetches.resolve(&uuid, xml) {
        ResolveOutcome::Resolved => {
            debug!(listener = mc.listener.id(), "Found waiting slot for {}", uuid);
            Outcome::ok()
        }
        ResolveOutcome::TimedOut => Outcome::error("timeout"),
        ResolveOutcome::Duplicate => Outcome::error("duplicate_response"),
        ResolveOutcome::Unknown => Outcome::error("invalid_uuid"),
    }
}

/// `{rex, {Ref, Pid}}`, the answer to a spawn RPC
fn rex(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    match args.first().and_then(Term::as_tuple) {
        Some(items) => super::spawn_reply(mc, items),
        None => {
            debug!(listener = mc.listener.id(), "Unknown rpc response");
            Outcome::NoReply
        }
    }
}

/// `{ack, Key}` stops resending a background reply
fn ack(mc: &MessageContext<'_>, args: &[Term]) -> Outcome {
    let Some(key) = args.first().and_then(Term::as_text) else {
        return Outcome::badarg();
    };
    if mc.listener.retries().acknowledge(&key) {
        Outcome::ok()
    } else {
        Outcome::error("invalid_key")
    }
}

fn nolog(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    if mc.listener.log_enabled() {
        mc.listener.disable_log();
        mc.listener.unwatch_everywhere(&Watch::LogReceiver);
    }
    Outcome::ok()
}

fn register_log_handler(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    mc.listener.unwatch_everywhere(&Watch::LogReceiver);
    mc.listener.set_log_receiver(ProcessAddress::Pid(mc.from.clone()));
    mc.listener.watch(mc.from, Watch::LogReceiver);
    Outcome::Link(mc.from.clone(), Some(Term::ok()))
}

fn register_event_handler(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    mc.listener.unwatch_everywhere(&Watch::EventReceiver);
    mc.listener.set_event_receiver(ProcessAddress::Pid(mc.from.clone()));
    mc.listener.watch(mc.from, Watch::EventReceiver);
    Outcome::Link(mc.from.clone(), Some(Term::ok()))
}

fn noevents(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    if mc.listener.disable_events() {
        mc.listener.unwatch_everywhere(&Watch::EventReceiver);
        Outcome::ok()
    } else {
        Outcome::error("notlistening")
    }
}

fn session_noevents(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    let Some(session) = mc.listener.session_by_controller(mc.from) else {
        return Outcome::error("nosession");
    };
    session.with_filter(|filter| filter.clear());
    session.purge_events();
    Outcome::ok()
}

fn exit(_mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    Outcome::Exit(Term::ok())
}

fn getpid(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    Outcome::Reply(Term::ok_with(Term::Pid(mc.listener.self_pid().clone())))
}

fn link(mc: &MessageContext<'_>, _args: &[Term]) -> Outcome {
    Outcome::Link(mc.from.clone(), None)
}
