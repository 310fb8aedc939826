//! Engine events and log lines, and their wire encodings

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumCount, EnumIter, EnumString, IntoStaticStr};

use crate::term::{StringEncoding, Term};

/// Header carrying the call a channel event belongs to
pub const UNIQUE_ID_HEADER: &str = "Unique-ID";

/// Engine event types
///
/// `All` is never fired; it only appears in subscriptions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    IntoStaticStr,
    EnumString,
    EnumCount,
    EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum EventType {
    Custom,
    Clone,
    ChannelCreate,
    ChannelDestroy,
    ChannelState,
    ChannelCallstate,
    ChannelAnswer,
    ChannelHangup,
    ChannelHangupComplete,
    ChannelExecute,
    ChannelExecuteComplete,
    ChannelHold,
    ChannelUnhold,
    ChannelBridge,
    ChannelUnbridge,
    ChannelProgress,
    ChannelProgressMedia,
    ChannelOutgoing,
    ChannelPark,
    ChannelUnpark,
    ChannelApplication,
    ChannelOriginate,
    ChannelUuid,
    ChannelData,
    Api,
    Log,
    InboundChan,
    OutboundChan,
    Startup,
    Shutdown,
    Publish,
    Unpublish,
    Talk,
    Notalk,
    SessionCrash,
    ModuleLoad,
    ModuleUnload,
    Dtmf,
    Message,
    PresenceIn,
    PresenceOut,
    PresenceProbe,
    MessageWaiting,
    MessageQuery,
    Roster,
    Codec,
    BackgroundJob,
    DetectedSpeech,
    DetectedTone,
    PrivateCommand,
    Heartbeat,
    Trap,
    AddSchedule,
    DelSchedule,
    ExeSchedule,
    ReSchedule,
    ReloadXml,
    Notify,
    SendMessage,
    RecvMessage,
    RequestParams,
    ChannelAction,
    RecordStart,
    RecordStop,
    PlaybackStart,
    PlaybackStop,
    CallUpdate,
    Failure,
    SocketData,
    MediaBugStart,
    MediaBugStop,
    SessionHeartbeat,
    All,
}

impl EventType {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Position in a per-type subscription table
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// An engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: EventType,
    subclass: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            subclass: None,
            headers: vec![("Event-Name".to_string(), event_type.name().to_string())],
            body: None,
        }
    }

    /// A `CUSTOM` event of the given subclass
    pub fn custom(subclass: impl Into<String>) -> Self {
        let subclass = subclass.into();
        let mut event = Self::new(EventType::Custom);
        event.add_header("Event-Subclass", subclass.clone());
        event.subclass = Some(subclass);
        event
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn subclass(&self) -> Option<&str> {
        self.subclass.as_deref()
    }

    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// The call this event belongs to, if any
    pub fn unique_id(&self) -> Option<&str> {
        self.header(UNIQUE_ID_HEADER)
    }

    /// `{event, [UniqueId | undefined, {Name, Value}..., {body, Body}]}`
    pub fn to_term(&self, encoding: StringEncoding) -> Term {
        self.to_tagged_term("event", encoding)
    }

    pub fn to_tagged_term(&self, tag: &str, encoding: StringEncoding) -> Term {
        let mut items = Vec::with_capacity(self.headers.len() + 2);
        items.push(match self.unique_id() {
            Some(uuid) => Term::text(uuid, encoding),
            None => Term::atom("undefined"),
        });
        for (name, value) in &self.headers {
            items.push(Term::tuple(vec![Term::text(name.as_str(), encoding), Term::text(value.as_str(), encoding)]));
        }
        if let Some(body) = &self.body {
            items.push(Term::tuple(vec![Term::atom("body"), Term::text(body.as_str(), encoding)]));
        }
        Term::tuple(vec![Term::atom(tag), Term::list(items)])
    }
}

/// Log severities, most severe first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, AsRefStr, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    #[strum(to_string = "console", serialize = "emerg", serialize = "emergency")]
    Console = 0,
    Alert = 1,
    #[strum(to_string = "crit", serialize = "critical")]
    Crit = 2,
    #[strum(to_string = "err", serialize = "error")]
    Err = 3,
    #[strum(to_string = "warning", serialize = "warn")]
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    pub fn as_number(self) -> u8 {
        self as u8
    }

    /// Whether a line at `level` passes a threshold of `self`
    pub fn admits(self, level: LogLevel) -> bool {
        level <= self
    }
}

/// A log line produced by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub file: String,
    pub func: String,
    pub line: u32,
    pub data: String,
    pub user_data: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, data: impl Into<String>) -> Self {
        Self {
            level,
            file: String::new(),
            func: String::new(),
            line: 0,
            data: data.into(),
            user_data: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, func: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.func = func.into();
        self.line = line;
        self
    }

    /// `{log, [{level,N},{text_channel,N},{file,F},{func,Fn},{line,L},{data,D},{user_data,U}]}`
    pub fn to_term(&self, encoding: StringEncoding) -> Term {
        let level = i64::from(self.level.as_number());
        let pair = |key: &str, value: Term| Term::tuple(vec![Term::atom(key), value]);
        Term::tuple(vec![
            Term::atom("log"),
            Term::list(vec![
                pair("level", Term::Integer(level)),
                pair("text_channel", Term::Integer(level)),
                pair("file", Term::text(self.file.as_str(), encoding)),
                pair("func", Term::text(self.func.as_str(), encoding)),
                pair("line", Term::Integer(i64::from(self.line))),
                pair("data", Term::text(self.data.as_str(), encoding)),
                pair("user_data", Term::text(self.user_data.as_deref().unwrap_or(""), encoding)),
            ]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::ChannelDestroy.name(), "CHANNEL_DESTROY");
        assert_eq!(EventType::BackgroundJob.as_ref(), "BACKGROUND_JOB");
        assert_eq!(EventType::from_str("channel_answer").unwrap(), EventType::ChannelAnswer);
        assert_eq!(EventType::from_str("ALL").unwrap(), EventType::All);
        assert!(EventType::from_str("NOPE").is_err());
        assert!(EventType::All.index() < EventType::COUNT);
    }

    #[test]
    fn test_log_level_parsing_and_threshold() {
        assert_eq!(LogLevel::from_str("debug").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("ERROR").unwrap(), LogLevel::Err);
        assert_eq!(LogLevel::from_str("critical").unwrap(), LogLevel::Crit);
        assert_eq!(LogLevel::Err.as_ref(), "err");
        assert!(LogLevel::Debug.admits(LogLevel::Info));
        assert!(!LogLevel::Warning.admits(LogLevel::Info));
        assert!(LogLevel::Warning.admits(LogLevel::Crit));
    }

    #[test]
    fn test_event_term() {
        let event = Event::new(EventType::ChannelAnswer)
            .with_header(UNIQUE_ID_HEADER, "abc")
            .with_body("hi");
        let term = event.to_term(StringEncoding::String);
        assert_eq!(
            term,
            Term::tuple(vec![
                Term::atom("event"),
                Term::list(vec![
                    Term::String("abc".into()),
                    Term::tuple(vec![Term::String("Event-Name".into()), Term::String("CHANNEL_ANSWER".into())]),
                    Term::tuple(vec![Term::String("Unique-ID".into()), Term::String("abc".into())]),
                    Term::tuple(vec![Term::atom("body"), Term::String("hi".into())]),
                ]),
            ])
        );
    }

    #[test]
    fn test_event_without_call_is_undefined() {
        let term = Event::custom("my::thing").to_term(StringEncoding::Binary);
        let items = term.as_tuple().unwrap()[1].as_list().unwrap();
        assert_eq!(items[0], Term::atom("undefined"));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_log_term_shape() {
        let entry = LogEntry::new(LogLevel::Notice, "hello").at("a.c", "main", 7);
        let term = entry.to_term(StringEncoding::String);
        let items = term.as_tuple().unwrap()[1].as_list().unwrap();
        assert_eq!(items.len(), 7);
        assert_eq!(items[0], Term::tuple(vec![Term::atom("level"), Term::Integer(5)]));
        assert_eq!(items[6], Term::tuple(vec![Term::atom("user_data"), Term::String(String::new())]));
    }
}
