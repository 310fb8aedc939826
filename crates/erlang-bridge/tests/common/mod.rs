//! Shared fixtures for the bridge integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_erlang_bridge::prelude::*;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(200);

/// Call engine double recording what the bridge asked of it
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<HashMap<String, Event>>,
    commands: Mutex<HashMap<String, String>>,
    pub fired: Mutex<Vec<Event>>,
    pub queued: Mutex<Vec<(String, Event)>>,
    pub controlled: Mutex<HashSet<String>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_call(&self, uuid: &str) {
        let data = Event::new(EventType::ChannelData)
            .with_header("Unique-ID", uuid)
            .with_header("Channel-State", "CS_EXECUTE");
        self.calls.lock().insert(uuid.to_string(), data);
    }

    pub fn add_command(&self, name: &str, output: &str) {
        self.commands.lock().insert(name.to_string(), output.to_string());
    }

    pub fn is_controlled(&self, uuid: &str) -> bool {
        self.controlled.lock().contains(uuid)
    }

    pub fn fired_of(&self, event_type: EventType) -> Vec<Event> {
        self.fired
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl CallEngine for MockEngine {
    fn execute_api(&self, command: &str, _arg: &str) -> Option<String> {
        self.commands.lock().get(command).cloned()
    }

    fn fire_event(&self, event: Event) {
        self.fired.lock().push(event);
    }

    fn call_data(&self, uuid: &str) -> Option<Event> {
        self.calls.lock().get(uuid).cloned()
    }

    fn queue_call_message(&self, uuid: &str, message: Event) -> bool {
        self.queued.lock().push((uuid.to_string(), message));
        true
    }

    fn set_call_controlled(&self, uuid: &str, controlled: bool) {
        let mut set = self.controlled.lock();
        if controlled {
            set.insert(uuid.to_string());
        } else {
            set.remove(uuid);
        }
    }
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        hostname: Some("localhost".to_string()),
        poll_interval_ms: 10,
        fetch_timeout_ms: 500,
        spawn_timeout_ms: 200,
        acl_drain_timeout_ms: 500,
        ..BridgeConfig::default()
    }
}

pub fn new_bridge(engine: &Arc<MockEngine>) -> Arc<ErlangBridge> {
    new_bridge_with(engine, test_config())
}

pub fn new_bridge_with(engine: &Arc<MockEngine>, config: BridgeConfig) -> Arc<ErlangBridge> {
    let engine: Arc<dyn CallEngine> = engine.clone();
    Arc::new(ErlangBridge::new(config, engine).expect("bridge"))
}

pub fn text(s: &str) -> Term {
    Term::String(s.to_string())
}

/// Tag of a tagged tuple, or the atom itself
pub fn tag(term: &Term) -> Option<&str> {
    match term {
        Term::Atom(name) => Some(name),
        Term::Tuple(items) => items.first().and_then(Term::as_atom),
        _ => None,
    }
}

/// Poll `condition` until it holds or `WAIT` runs out
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Send `message` from the peer's default process and return the answer
pub async fn call(peer: &PeerHandle, message: Term) -> Term {
    peer.send(message).expect("send");
    peer.recv_term(WAIT).await.expect("reply")
}
