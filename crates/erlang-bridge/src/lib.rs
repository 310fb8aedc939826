//! # RVoIP Erlang Bridge
//!
//! Lets Erlang nodes observe and drive the call engine over node-to-node
//! messaging.
//!
//! ## Features
//!
//! - **Event fan-out**: per-connection subscriptions with header filters and
//!   bounded, lossy queues that never block the engine
//! - **Log forwarding**: engine log lines above a per-connection threshold
//! - **Call control**: calls attached to a remote process, either inbound via
//!   `handlecall` or outbound to a registered or spawned controller
//! - **Commands**: `api` inline and `bgapi` on a bounded worker pool
//! - **Lookups**: configuration and directory fetches answered by bound peers
//! - **Admission**: inbound CIDR access lists
//!
//! ## Architecture
//!
//! - `node`: connection abstraction, TCP transport and in-process pairs
//! - `listener`: per-connection state and its main loop
//! - `dispatch`: the message vocabulary peers speak
//! - `fanout`, `session`, `fetch`, `commands`: the features above
//! - `bridge`: the root object tying it together

pub mod admin;
pub mod admission;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod correlation;
mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod fanout;
pub mod fetch;
pub mod listener;
pub mod logging;
pub mod node;
pub mod registry;
pub mod session;
pub mod term;

pub use bridge::ErlangBridge;
pub use config::BridgeConfig;
pub use engine::CallEngine;
pub use error::{BridgeError, Result};
pub use event::{Event, EventType, LogEntry, LogLevel};
pub use fetch::{FetchRequest, XmlSection};
pub use listener::{Direction, Listener, ListenerState};
pub use session::{AttachTarget, SessionHandle, SpawnTarget};
pub use term::{Pid, Ref, StringEncoding, Term};

pub mod prelude {
    pub use crate::bridge::ErlangBridge;
    pub use crate::config::BridgeConfig;
    pub use crate::engine::CallEngine;
    pub use crate::error::{BridgeError, Result};
    pub use crate::event::{Event, EventType, LogEntry, LogLevel};
    pub use crate::fetch::{FetchRequest, XmlSection};
    pub use crate::node::memory::PeerHandle;
    pub use crate::node::{ControlMessage, NodeConnection, ProcessAddress};
    pub use crate::session::{AttachTarget, SessionHandle};
    pub use crate::term::{Pid, Ref, StringEncoding, Term};
}
