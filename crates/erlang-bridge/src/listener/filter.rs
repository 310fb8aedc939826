//! Event subscriptions
//!
//! A subscription is a per-type flag table, a set of `CUSTOM` subclasses and
//! an optional list of header filters. The `ALL` flag matches every event,
//! custom subclasses included.

use std::collections::HashSet;

use strum::{EnumCount, IntoEnumIterator};
use tracing::debug;

use crate::event::{Event, EventType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    Added(String, String),
    Deleted(String, Option<String>),
}

#[derive(Debug, Clone)]
pub struct EventSubscription {
    enabled: [bool; EventType::COUNT],
    subclasses: HashSet<String>,
    header_filters: Vec<(String, String)>,
}

impl Default for EventSubscription {
    fn default() -> Self {
        Self::none()
    }
}

impl EventSubscription {
    /// Nothing enabled
    pub fn none() -> Self {
        Self {
            enabled: [false; EventType::COUNT],
            subclasses: HashSet::new(),
            header_filters: Vec::new(),
        }
    }

    /// Every event
    pub fn all() -> Self {
        let mut sub = Self::none();
        sub.enable_all();
        sub
    }

    fn enable_all(&mut self) {
        self.enabled = [true; EventType::COUNT];
    }

    pub fn is_enabled(&self, event_type: EventType) -> bool {
        self.enabled[event_type.index()]
    }

    pub fn has_subclass(&self, subclass: &str) -> bool {
        self.subclasses.contains(subclass)
    }

    /// Whether no type is enabled at all
    pub fn is_empty(&self) -> bool {
        !self.enabled.iter().any(|e| *e)
    }

    /// Apply an `event` request
    ///
    /// Names after `CUSTOM` are subclasses. Unknown type names are skipped.
    pub fn subscribe<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let mut custom = false;
        for name in names {
            if custom {
                self.subclasses.insert(name.to_string());
                continue;
            }
            match name.parse::<EventType>() {
                Ok(EventType::All) => {
                    debug!("ALL events enabled");
                    self.enable_all();
                }
                Ok(event_type) => {
                    self.enabled[event_type.index()] = true;
                    custom = event_type == EventType::Custom;
                }
                Err(_) => debug!("Ignoring unknown event type {}", name),
            }
        }
    }

    /// Apply a `nixevent` request
    ///
    /// Removing one type while `ALL` is set keeps every other type enabled.
    pub fn unsubscribe<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let mut custom = false;
        for name in names {
            if custom {
                self.subclasses.remove(name);
                continue;
            }
            match name.parse::<EventType>() {
                Ok(EventType::Custom) => custom = true,
                Ok(EventType::All) => {
                    self.enabled = [false; EventType::COUNT];
                }
                Ok(event_type) => {
                    self.enabled[EventType::All.index()] = false;
                    self.enabled[event_type.index()] = false;
                }
                Err(_) => debug!("Ignoring unknown event type {}", name),
            }
        }
    }

    /// Apply a `setevent` request
    pub fn replace<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        self.enabled = [false; EventType::COUNT];
        self.subclasses.clear();
        self.subscribe(names);
    }

    /// Forget all types, subclasses and header filters
    pub fn clear(&mut self) {
        *self = Self::none();
    }

    pub fn add_header_filter(&mut self, header: &str, value: &str) -> FilterAction {
        if !self
            .header_filters
            .iter()
            .any(|(h, v)| h.eq_ignore_ascii_case(header) && v == value)
        {
            self.header_filters.push((header.to_string(), value.to_string()));
        }
        FilterAction::Added(header.to_string(), value.to_string())
    }

    /// Remove one header/value pair, or every filter on `header` when `value` is `None`
    pub fn delete_header_filter(&mut self, header: &str, value: Option<&str>) -> FilterAction {
        self.header_filters
            .retain(|(h, v)| !(h.eq_ignore_ascii_case(header) && value.map_or(true, |value| v == value)));
        FilterAction::Deleted(header.to_string(), value.map(str::to_string))
    }

    pub fn clear_header_filters(&mut self) -> FilterAction {
        self.header_filters.clear();
        FilterAction::Deleted("all".to_string(), None)
    }

    pub fn header_filters(&self) -> &[(String, String)] {
        &self.header_filters
    }

    /// Enabled type names, `ALL` alone when everything is on
    pub fn enabled_names(&self) -> Vec<&'static str> {
        if self.is_enabled(EventType::All) {
            return vec![EventType::All.name()];
        }
        EventType::iter()
            .filter(|t| self.is_enabled(*t))
            .map(|t| t.name())
            .collect()
    }

    pub fn should_deliver(&self, event: &Event) -> bool {
        let type_match = if self.is_enabled(EventType::All) {
            true
        } else if self.is_enabled(event.event_type()) {
            event.event_type() != EventType::Custom
                || event.subclass().map_or(true, |subclass| self.has_subclass(subclass))
        } else {
            false
        };

        type_match && self.passes_header_filters(event)
    }

    fn passes_header_filters(&self, event: &Event) -> bool {
        if self.header_filters.is_empty() {
            return true;
        }
        self.header_filters
            .iter()
            .any(|(header, value)| event.header(header) == Some(value.as_str()))
    }
}
