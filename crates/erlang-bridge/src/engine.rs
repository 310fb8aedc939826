//! The call engine the bridge serves
//!
//! Implemented by the host. All methods are synchronous and may be called from
//! blocking worker threads; `execute_api` in particular can take a while.

use crate::event::Event;

pub trait CallEngine: Send + Sync + 'static {
    /// Run an administrative command; `None` when the command does not exist
    fn execute_api(&self, command: &str, arg: &str) -> Option<String>;

    /// Fire an event into the engine, which publishes it back to subscribers
    fn fire_event(&self, event: Event);

    /// Channel data for a live call, `None` if the call does not exist
    fn call_data(&self, uuid: &str) -> Option<Event>;

    /// Queue a message for execution on a call
    fn queue_call_message(&self, uuid: &str, message: Event) -> bool;

    /// Mark a call as controlled (or no longer controlled) by a remote process
    fn set_call_controlled(&self, uuid: &str, controlled: bool);
}
