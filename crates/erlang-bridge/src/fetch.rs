//! Configuration lookups answered by peer processes
//!
//! A peer process binds itself to an XML section with `{bind, Section}`. When
//! the engine needs a document for that section it calls [`fetch`], which
//! sends `{fetch, Section, Tag, Key, Value, UUID, Params}` to every process
//! bound to the section. All of them share one reply slot keyed by the UUID:
//! the first `{fetch_reply, UUID, Xml}` wins and later ones are told
//! `{error, duplicate_response}`.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strum::{AsRefStr, EnumIter, EnumString};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::BridgeContext;
use crate::correlation::{CorrelationTable, PendingReply, ResolveOutcome, WaitOutcome};
use crate::error::Result;
use crate::listener::ListenerId;
use crate::term::{Pid, StringEncoding, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum XmlSection {
    Result,
    Config,
    Directory,
    Dialplan,
    Phrases,
    Chatplan,
    Languages,
    Channels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBinding {
    pub listener_id: ListenerId,
    pub pid: Pid,
    pub section: XmlSection,
}

/// Processes bound to answer lookups, in bind order
#[derive(Debug, Default)]
pub struct FetchBindings {
    bindings: RwLock<Vec<FetchBinding>>,
}

impl FetchBindings {
    /// Returns false when the same binding already existed
    pub fn bind(&self, listener_id: ListenerId, pid: &Pid, section: XmlSection) -> bool {
        let binding = FetchBinding {
            listener_id,
            pid: pid.clone(),
            section,
        };
        let mut bindings = self.bindings.write();
        if bindings.contains(&binding) {
            return false;
        }
        debug!(listener = listener_id, "Bound {} to section {}", pid, section.as_ref());
        bindings.push(binding);
        true
    }

    pub fn unbind(&self, listener_id: ListenerId, pid: &Pid, section: XmlSection) {
        self.bindings
            .write()
            .retain(|b| !(b.listener_id == listener_id && &b.pid == pid && b.section == section));
    }

    /// Drop every binding made over a listener
    pub fn remove_listener(&self, listener_id: ListenerId) -> usize {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| b.listener_id != listener_id);
        before - bindings.len()
    }

    /// Every binding for `section`, in bind order
    pub fn bound_to(&self, section: XmlSection) -> Vec<FetchBinding> {
        self.bindings.read().iter().filter(|b| b.section == section).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}

/// One lookup issued by the engine
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub section: XmlSection,
    pub tag_name: Option<String>,
    pub key_name: Option<String>,
    pub key_value: Option<String>,
    pub params: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(section: XmlSection) -> Self {
        Self {
            section,
            tag_name: None,
            key_name: None,
            key_value: None,
            params: Vec::new(),
        }
    }

    pub fn with_key(mut self, tag_name: &str, key_name: &str, key_value: &str) -> Self {
        self.tag_name = Some(tag_name.to_string());
        self.key_name = Some(key_name.to_string());
        self.key_value = Some(key_value.to_string());
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    fn to_term(&self, uuid: &str, encoding: StringEncoding) -> Term {
        let or_undefined = |value: &Option<String>| Term::text(value.as_deref().unwrap_or("undefined"), encoding);
        Term::tuple(vec![
            Term::atom("fetch"),
            Term::atom(self.section.as_ref()),
            or_undefined(&self.tag_name),
            or_undefined(&self.key_name),
            or_undefined(&self.key_value),
            Term::text(uuid, encoding),
            Term::list(
                self.params
                    .iter()
                    .map(|(k, v)| Term::tuple(vec![Term::text(k.as_str(), encoding), Term::text(v.as_str(), encoding)]))
                    .collect(),
            ),
        ])
    }
}

/// Lookups in flight, shared by every listener
///
/// Each request remembers the listeners it went out on; when the last of them
/// closes the waiter is released instead of sitting out the timeout.
pub struct PendingFetches {
    replies: CorrelationTable<String>,
    targets: Mutex<HashMap<String, Vec<ListenerId>>>,
}

impl Default for PendingFetches {
    fn default() -> Self {
        Self {
            replies: CorrelationTable::retaining_filled("fetch"),
            targets: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingFetches {
    fn register(&self, uuid: &str, listeners: Vec<ListenerId>) -> Result<PendingReply<String>> {
        let pending = self.replies.register(uuid)?;
        self.targets.lock().insert(uuid.to_string(), listeners);
        Ok(pending)
    }

    fn finish(&self, uuid: &str) {
        self.targets.lock().remove(uuid);
    }

    /// Offer a `fetch_reply` from any listener
    pub fn resolve(&self, uuid: &str, xml: String) -> ResolveOutcome {
        self.replies.resolve(uuid, xml)
    }

    /// Forget a closed listener; lookups left with no listener are aborted
    pub fn release_listener(&self, listener_id: ListenerId) -> usize {
        let orphaned: Vec<String> = {
            let mut targets = self.targets.lock();
            let mut orphaned = Vec::new();
            targets.retain(|uuid, listeners| {
                listeners.retain(|id| *id != listener_id);
                if listeners.is_empty() {
                    orphaned.push(uuid.clone());
                    return false;
                }
                true
            });
            orphaned
        };
        orphaned.iter().filter(|uuid| self.replies.abort(uuid)).count()
    }

    pub fn prune(&self, grace: Duration) {
        self.replies.prune(grace);
    }

    pub fn is_pending(&self, uuid: &str) -> bool {
        self.replies.is_pending(uuid)
    }
}

/// Ask every bound peer for a document; `None` means not found
pub(crate) async fn fetch(ctx: &BridgeContext, request: &FetchRequest) -> Option<String> {
    let bindings = ctx.bindings.bound_to(request.section);
    if bindings.is_empty() {
        debug!("No binding for section {}", request.section.as_ref());
        return None;
    }

    let uuid = Uuid::new_v4().to_string();
    let pending = ctx
        .fetches
        .register(&uuid, bindings.iter().map(|b| b.listener_id).collect())
        .ok()?;

    let mut sent = 0;
    for binding in &bindings {
        let Some(listener) = ctx.registry.get(binding.listener_id) else {
            debug!(listener = binding.listener_id, "Binding points at a closed listener");
            continue;
        };
        debug!(
            listener = listener.id(),
            "Fetch {} {:?}={:?} from {} ({})",
            request.section.as_ref(),
            request.key_name,
            request.key_value,
            binding.pid,
            uuid
        );
        let message = request.to_term(&uuid, listener.encoding());
        match listener.connection().send_to(&binding.pid, message).await {
            Ok(()) => sent += 1,
            Err(e) => warn!(listener = listener.id(), "Failed to send fetch request: {}", e),
        }
    }

    if sent == 0 {
        ctx.fetches.finish(&uuid);
        ctx.fetches.replies.forget(pending);
        return None;
    }

    let outcome = ctx.fetches.replies.wait(pending, ctx.config.fetch_timeout()).await;
    ctx.fetches.finish(&uuid);
    match outcome {
        WaitOutcome::Found(xml) => Some(xml),
        WaitOutcome::TimedOut => {
            warn!(
                "Timed out after {:?} waiting for fetch response for {}",
                ctx.config.fetch_timeout(),
                uuid
            );
            None
        }
        WaitOutcome::Aborted => {
            debug!("Fetch {} aborted, every bound listener closed", uuid);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_section_names() {
        assert_eq!(XmlSection::from_str("dialplan").unwrap(), XmlSection::Dialplan);
        assert_eq!(XmlSection::from_str("DIRECTORY").unwrap(), XmlSection::Directory);
        assert_eq!(XmlSection::Chatplan.as_ref(), "chatplan");
        assert!(XmlSection::from_str("nowhere").is_err());
    }

    #[test]
    fn test_bindings_in_order_and_cleanup() {
        let bindings = FetchBindings::default();
        let a = Pid::new("peer@box", 1, 0, 1);
        let b = Pid::new("peer@box", 2, 0, 1);

        assert!(bindings.bind(1, &a, XmlSection::Dialplan));
        assert!(!bindings.bind(1, &a, XmlSection::Dialplan));
        bindings.bind(2, &b, XmlSection::Dialplan);
        bindings.bind(2, &b, XmlSection::Directory);

        let dialplan: Vec<_> = bindings.bound_to(XmlSection::Dialplan).into_iter().map(|b| b.pid).collect();
        assert_eq!(dialplan, vec![a.clone(), b.clone()]);
        assert!(bindings.bound_to(XmlSection::Config).is_empty());

        bindings.unbind(1, &a, XmlSection::Dialplan);
        assert_eq!(bindings.bound_to(XmlSection::Dialplan)[0].pid, b);

        assert_eq!(bindings.remove_listener(2), 2);
        assert!(bindings.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_released_when_last_listener_closes() {
        let fetches = PendingFetches::default();
        let pending = fetches.register("u-1", vec![1, 2]).unwrap();

        assert_eq!(fetches.release_listener(1), 0);
        assert!(fetches.is_pending("u-1"));
        assert_eq!(fetches.release_listener(2), 1);
        assert_eq!(
            fetches.replies.wait(pending, Duration::from_secs(5)).await,
            WaitOutcome::Aborted
        );
    }

    #[test]
    fn test_request_term() {
        let request = FetchRequest::new(XmlSection::Directory)
            .with_key("domain", "name", "example.com")
            .with_param("user", "1000");
        let term = request.to_term("u-1", StringEncoding::String);
        let text = |s: &str| Term::String(s.to_string());
        assert_eq!(
            term,
            Term::tuple(vec![
                Term::atom("fetch"),
                Term::atom("directory"),
                text("domain"),
                text("name"),
                text("example.com"),
                text("u-1"),
                Term::list(vec![Term::tuple(vec![text("user"), text("1000")])]),
            ])
        );

        let bare = FetchRequest::new(XmlSection::Config).to_term("u-2", StringEncoding::String);
        assert_eq!(bare.as_tuple().unwrap()[2], text("undefined"));
    }
}
