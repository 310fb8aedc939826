//! Copying engine events and log lines onto subscriber queues
//!
//! Called from engine threads. Nothing here awaits or blocks on a peer: every
//! enqueue is a short lock on one queue, and a full queue drops the item and
//! counts the loss.

use tracing::{trace, warn};

use crate::event::{Event, EventType, LogEntry, LogLevel};
use crate::listener::{Listener, PushOutcome};
use crate::registry::ListenerRegistry;

/// Notice queued ahead of the first event accepted after losses
pub fn lost_events_notice(lost: u64) -> Event {
    Event::new(EventType::Trap).with_header("info", format!("lost {} events", lost))
}

pub fn lost_log_notice(lost: u64) -> LogEntry {
    LogEntry::new(LogLevel::Crit, format!("Lost {} log lines", lost)).at(file!(), "lost_log_notice", line!())
}

impl Listener {
    /// Queue `event` for this listener's attached calls and subscription
    pub fn offer_event(&self, event: &Event) {
        if let Some(session) = event.unique_id().and_then(|uuid| self.session(uuid)) {
            session.offer(event);
        }

        if !self.events_enabled() || !self.with_subscription(|s| s.should_deliver(event)) {
            return;
        }

        match self.event_queue().push(event.clone(), lost_events_notice) {
            PushOutcome::Queued => {}
            PushOutcome::QueuedAfterNotice(lost) => {
                warn!(listener = self.id(), "Event queue recovered after losing {} events", lost)
            }
            PushOutcome::Dropped => trace!(listener = self.id(), "Event queue full, dropped {}", event.event_type()),
        }
    }

    /// Queue `entry` if the log receiver wants this level
    pub fn offer_log(&self, entry: &LogEntry) {
        if !self.log_enabled() || !self.log_level().admits(entry.level) {
            return;
        }

        match self.log_queue().push(entry.clone(), lost_log_notice) {
            PushOutcome::Queued => {}
            PushOutcome::QueuedAfterNotice(lost) => {
                warn!(listener = self.id(), "Log queue recovered after losing {} lines", lost)
            }
            PushOutcome::Dropped => {}
        }
    }
}

impl ListenerRegistry {
    /// Fan `event` out to every listener
    pub fn publish_event(&self, event: &Event) {
        self.for_each(|listener| listener.offer_event(event));
    }

    pub fn publish_log(&self, entry: &LogEntry) {
        self.for_each(|listener| listener.offer_log(entry));
    }
}
