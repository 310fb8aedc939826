//! Cleanup actions keyed by watched peer process
//!
//! Whenever a role is handed to a remote pid (log receiver, event receiver,
//! call controller, fetch handler) the pid is linked and a watch is recorded
//! here. When the peer reports the pid gone, its watches are taken out and
//! each one is undone.

use std::collections::HashMap;

use crate::fetch::XmlSection;
use crate::term::Pid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Watch {
    LogReceiver,
    EventReceiver,
    /// Controller of the call with this uuid
    Session(String),
    FetchBinding(XmlSection),
}

#[derive(Debug, Default)]
pub struct WatchTable {
    watches: HashMap<Pid, Vec<Watch>>,
}

impl WatchTable {
    /// Record a watch; false if the pid was not watched before (needs a link)
    pub fn add(&mut self, pid: &Pid, watch: Watch) -> bool {
        let newly_watched = !self.watches.contains_key(pid);
        let entries = self.watches.entry(pid.clone()).or_default();
        if !entries.contains(&watch) {
            entries.push(watch);
        }
        newly_watched
    }

    pub fn remove(&mut self, pid: &Pid, watch: &Watch) {
        if let Some(entries) = self.watches.get_mut(pid) {
            entries.retain(|w| w != watch);
            if entries.is_empty() {
                self.watches.remove(pid);
            }
        }
    }

    /// Forget `watch` for whichever pid held it
    pub fn remove_everywhere(&mut self, watch: &Watch) {
        self.watches.retain(|_, entries| {
            entries.retain(|w| w != watch);
            !entries.is_empty()
        });
    }

    /// Everything to undo now that `pid` is gone
    pub fn take(&mut self, pid: &Pid) -> Vec<Watch> {
        self.watches.remove(pid).unwrap_or_default()
    }

    pub fn is_watched(&self, pid: &Pid) -> bool {
        self.watches.contains_key(pid)
    }

    pub fn clear(&mut self) {
        self.watches.clear();
    }
}
