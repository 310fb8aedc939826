//! Operator console commands

use std::fmt::Write;

use crate::bridge::ErlangBridge;
use crate::registry::ListenerRegistry;

pub const USAGE: &str = "Supply some arguments, maybe one of: listeners, sessions <node>";

/// Run one console command line and return its text output
pub fn execute(bridge: &ErlangBridge, line: &str) -> String {
    let mut args = line.split_whitespace();
    match (args.next(), args.next()) {
        (Some("listeners"), None) => list_listeners(bridge.registry()),
        (Some("sessions"), Some(node)) => list_sessions(bridge.registry(), node),
        _ => format!("{}\n", USAGE),
    }
}

fn list_listeners(registry: &ListenerRegistry) -> String {
    let listeners = registry.snapshot();
    if listeners.is_empty() {
        return "No active listeners\n".to_string();
    }

    let mut out = String::new();
    for listener in listeners {
        let _ = writeln!(
            out,
            "Listener to {} with {} outbound sessions",
            listener.peer_node(),
            listener.session_count()
        );
    }
    out
}

fn list_sessions(registry: &ListenerRegistry, node: &str) -> String {
    let found = registry.snapshot().into_iter().find(|l| l.peer_node() == node);
    let Some(listener) = found else {
        return format!("Could not find a listener for {}\n", node);
    };

    let sessions = listener.sessions();
    if sessions.is_empty() {
        return format!("No active sessions for {}\n", node);
    }

    let mut out = String::new();
    for session in sessions {
        let _ = writeln!(
            out,
            "Outbound session for {} in state {}",
            session.uuid(),
            session.channel_state()
        );
    }
    out
}

impl ErlangBridge {
    /// Run an operator console command
    pub fn console(&self, line: &str) -> String {
        execute(self, line)
    }
}
