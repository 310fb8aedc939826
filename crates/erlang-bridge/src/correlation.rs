//! Request/reply correlation
//!
//! A waiter registers a key, sends its request, then waits on a oneshot for
//! whoever resolves the key first. Each entry leaves the pending state at most
//! once: resolved, timed out or aborted. A timed-out entry stays behind as a
//! tombstone so a late reply can be told apart from an unknown key. Tables
//! built with [`CorrelationTable::retaining_filled`] keep answered entries the
//! same way, for requests sent to several peers at once. The housekeeping
//! sweep prunes tombstones after a grace period.
//!
//! [`RetryTable`] is the outbound counterpart: messages resent on a timer
//! until the peer acknowledges them or the attempts run out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::RetryPolicy;
use crate::error::{BridgeError, Result};
use crate::node::ProcessAddress;
use crate::term::Term;

/// What happened to a reply offered to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Handed to the waiter
    Resolved,
    /// The waiter already gave up
    TimedOut,
    /// Another reply got there first
    Duplicate,
    /// No such key
    Unknown,
}

/// How a wait ended
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Found(T),
    TimedOut,
    /// The table was shut down under the waiter
    Aborted,
}

enum Slot<T> {
    Pending(oneshot::Sender<T>),
    Filled(Instant),
    TimedOut(Instant),
}

/// A registered key waiting for its reply
#[must_use = "a pending entry does nothing unless waited on"]
pub struct PendingReply<T> {
    key: String,
    rx: oneshot::Receiver<T>,
}

impl<T> PendingReply<T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

pub struct CorrelationTable<T> {
    name: &'static str,
    slots: Mutex<HashMap<String, Slot<T>>>,
    closed: Mutex<bool>,
    /// Keep answered entries so later replies read as duplicates
    retain_filled: bool,
}

impl<T: Send> CorrelationTable<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
            retain_filled: false,
        }
    }

    pub fn retaining_filled(name: &'static str) -> Self {
        Self {
            retain_filled: true,
            ..Self::new(name)
        }
    }

    pub fn register(&self, key: impl Into<String>) -> Result<PendingReply<T>> {
        let key = key.into();
        let closed = self.closed.lock();
        if *closed {
            return Err(BridgeError::closed(format!("{} table is shut down", self.name)));
        }
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        if slots.contains_key(&key) {
            return Err(BridgeError::invalid_argument(format!("{} key {} already registered", self.name, key)));
        }
        slots.insert(key.clone(), Slot::Pending(tx));
        trace!("{} registered {}", self.name, key);
        Ok(PendingReply { key, rx })
    }

    /// Offer a reply for `key`
    pub fn resolve(&self, key: &str, value: T) -> ResolveOutcome {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            None => ResolveOutcome::Unknown,
            Some(Slot::Filled(_)) => ResolveOutcome::Duplicate,
            Some(Slot::TimedOut(_)) => ResolveOutcome::TimedOut,
            Some(Slot::Pending(_)) => match slots.insert(key.to_string(), Slot::Filled(Instant::now())) {
                Some(Slot::Pending(tx)) => {
                    if tx.send(value).is_err() {
                        // Waiter dropped without recording a timeout
                        slots.insert(key.to_string(), Slot::TimedOut(Instant::now()));
                        return ResolveOutcome::TimedOut;
                    }
                    ResolveOutcome::Resolved
                }
                _ => ResolveOutcome::Unknown,
            },
        }
    }

    /// Wait for the reply to `pending`, at most `timeout`
    pub async fn wait(&self, pending: PendingReply<T>, timeout: Duration) -> WaitOutcome<T> {
        let PendingReply { key, mut rx } = pending;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(value)) => {
                self.consumed(&key);
                WaitOutcome::Found(value)
            }
            Ok(Err(_)) => {
                self.slots.lock().remove(&key);
                WaitOutcome::Aborted
            }
            Err(_) => {
                let mut slots = self.slots.lock();
                match slots.get(&key) {
                    Some(Slot::Pending(_)) => {
                        slots.insert(key.clone(), Slot::TimedOut(Instant::now()));
                        debug!("{} wait for {} timed out", self.name, key);
                        WaitOutcome::TimedOut
                    }
                    Some(Slot::Filled(_)) => {
                        // Resolved between the timer firing and taking the lock
                        if !self.retain_filled {
                            slots.remove(&key);
                        }
                        match rx.try_recv() {
                            Ok(value) => WaitOutcome::Found(value),
                            Err(_) => WaitOutcome::TimedOut,
                        }
                    }
                    Some(Slot::TimedOut(_)) => WaitOutcome::TimedOut,
                    None => WaitOutcome::Aborted,
                }
            }
        }
    }

    fn consumed(&self, key: &str) {
        if !self.retain_filled {
            self.slots.lock().remove(key);
        }
    }

    /// Withdraw a registration whose request never went out
    pub fn forget(&self, pending: PendingReply<T>) {
        self.slots.lock().remove(&pending.key);
    }

    /// Wake the waiter on `key` with `Aborted`; false when it was not waiting
    pub fn abort(&self, key: &str) -> bool {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Pending(_))) {
            slots.remove(key);
            return true;
        }
        false
    }

    pub fn is_pending(&self, key: &str) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Pending(_)))
    }

    /// Wake every waiter with `Aborted` and refuse new registrations
    pub fn abort_all(&self) -> usize {
        *self.closed.lock() = true;
        let drained: Vec<_> = self.slots.lock().drain().collect();
        let waiting = drained
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Pending(_)))
            .count();
        if waiting > 0 {
            debug!("{} aborted {} waiters", self.name, waiting);
        }
        waiting
    }

    /// Drop tombstones older than `grace` and entries whose waiter went away
    pub fn prune(&self, grace: Duration) {
        self.slots.lock().retain(|_, slot| match slot {
            Slot::Pending(tx) => !tx.is_closed(),
            Slot::Filled(at) | Slot::TimedOut(at) => at.elapsed() < grace,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

struct RetryEntry {
    to: ProcessAddress,
    message: Term,
    remaining: u32,
    next_at: Instant,
}

/// Messages resent until acknowledged
pub struct RetryTable {
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, RetryEntry>>,
}

impl RetryTable {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Track a message that was just sent; no-op when retrying is disabled
    pub fn schedule(&self, key: impl Into<String>, to: ProcessAddress, message: Term) {
        if self.policy.attempts == 0 {
            return;
        }
        self.entries.lock().insert(
            key.into(),
            RetryEntry {
                to,
                message,
                remaining: self.policy.attempts,
                next_at: Instant::now() + self.policy.interval(),
            },
        );
    }

    /// Stop resending `key`; false when it was not pending
    pub fn acknowledge(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Messages due for another attempt at `now`
    pub fn due(&self, now: Instant) -> Vec<(ProcessAddress, Term)> {
        let interval = self.policy.interval();
        let mut due = Vec::new();
        self.entries.lock().retain(|key, entry| {
            if entry.next_at > now {
                return true;
            }
            trace!("Resending {} to {} ({} left)", key, entry.to, entry.remaining - 1);
            due.push((entry.to.clone(), entry.message.clone()));
            entry.remaining -= 1;
            entry.next_at = now + interval;
            entry.remaining > 0
        });
        due
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let table = Arc::new(CorrelationTable::<String>::new("fetch"));
        let pending = table.register("k1").unwrap();

        let resolver = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(resolver.resolve("k1", "xml".to_string()), ResolveOutcome::Resolved);
        });

        assert_eq!(
            table.wait(pending, Duration::from_secs(2)).await,
            WaitOutcome::Found("xml".to_string())
        );
        assert!(table.is_empty());
        assert_eq!(table.resolve("k1", "again".into()), ResolveOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_late_reply_does_not_overwrite_timeout() {
        let table = CorrelationTable::<u32>::new("spawn");
        let pending = table.register("k").unwrap();
        assert_eq!(table.wait(pending, Duration::from_millis(20)).await, WaitOutcome::TimedOut);

        assert_eq!(table.resolve("k", 1), ResolveOutcome::TimedOut);
        assert_eq!(table.resolve("k", 2), ResolveOutcome::TimedOut);
        assert!(!table.is_pending("k"));

        table.prune(Duration::ZERO);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_reply_is_duplicate() {
        let table = CorrelationTable::<u32>::new("spawn");
        let pending = table.register("k").unwrap();
        assert_eq!(table.resolve("k", 1), ResolveOutcome::Resolved);
        assert_eq!(table.resolve("k", 2), ResolveOutcome::Duplicate);
        assert_eq!(table.wait(pending, Duration::from_secs(1)).await, WaitOutcome::Found(1));
    }

    #[tokio::test]
    async fn test_retained_entry_answers_duplicate_after_wait() {
        let table = CorrelationTable::<u32>::retaining_filled("fetch");
        let pending = table.register("k").unwrap();
        assert_eq!(table.resolve("k", 1), ResolveOutcome::Resolved);
        assert_eq!(table.wait(pending, Duration::from_secs(1)).await, WaitOutcome::Found(1));

        assert_eq!(table.resolve("k", 2), ResolveOutcome::Duplicate);
        assert_eq!(table.len(), 1);
        table.prune(Duration::ZERO);
        assert_eq!(table.resolve("k", 3), ResolveOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_abort_single_key() {
        let table = Arc::new(CorrelationTable::<u32>::new("fetch"));
        let pending = table.register("k").unwrap();
        let _other = table.register("other").unwrap();

        assert!(table.abort("k"));
        assert!(!table.abort("k"));
        assert_eq!(table.wait(pending, Duration::from_secs(5)).await, WaitOutcome::Aborted);
        assert!(table.is_pending("other"));
        assert!(table.register("k2").is_ok());
    }

    #[test]
    fn test_unknown_key_mutates_nothing() {
        let table = CorrelationTable::<u32>::new("fetch");
        let _pending = table.register("known").unwrap();
        assert_eq!(table.resolve("stranger", 5), ResolveOutcome::Unknown);
        assert_eq!(table.len(), 1);
        assert!(table.is_pending("known"));
    }

    #[tokio::test]
    async fn test_abort_releases_waiter_promptly() {
        let table = Arc::new(CorrelationTable::<u32>::new("fetch"));
        let pending = table.register("k").unwrap();

        let aborter = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            aborter.abort_all();
        });

        let started = Instant::now();
        assert_eq!(table.wait(pending, Duration::from_secs(30)).await, WaitOutcome::Aborted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(table.register("k2").is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let table = CorrelationTable::<u32>::new("fetch");
        let _first = table.register("k").unwrap();
        assert!(table.register("k").is_err());
    }

    #[test]
    fn test_retry_until_acknowledged() {
        let table = RetryTable::new(RetryPolicy { attempts: 2, interval_ms: 10 });
        let to = ProcessAddress::Name("ctl".into());
        table.schedule("job-1", to.clone(), Term::atom("done"));
        table.schedule("job-2", to.clone(), Term::atom("done"));

        let now = Instant::now();
        assert!(table.due(now).is_empty());

        let later = now + Duration::from_millis(20);
        assert_eq!(table.due(later).len(), 2);
        assert!(table.acknowledge("job-1"));
        assert!(!table.acknowledge("job-1"));

        let last = later + Duration::from_millis(20);
        assert_eq!(table.due(last), vec![(to, Term::atom("done"))]);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_retry_disabled() {
        let table = RetryTable::new(RetryPolicy::default());
        table.schedule("job", ProcessAddress::Name("ctl".into()), Term::ok());
        assert_eq!(table.len(), 0);
    }
}
