//! Typed terms exchanged with peer nodes
//!
//! This is the data model only. Turning terms into bytes is the job of the
//! [`FrameCodec`](crate::node::FrameCodec) plugged into the node connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process identifier on a (possibly remote) node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid {
    pub node: String,
    pub id: u32,
    pub serial: u32,
    pub creation: u32,
}

impl Pid {
    pub fn new(node: impl Into<String>, id: u32, serial: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            serial,
            creation,
        }
    }

    /// String key for lookup tables
    pub fn hash_key(&self) -> String {
        format!("{}.{}.{}@{}", self.creation, self.id, self.serial, self.node)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

/// Reference used to correlate asynchronous replies
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub node: String,
    pub creation: u32,
    pub ids: [u32; 3],
}

impl Ref {
    /// String key for lookup tables
    pub fn hash_key(&self) -> String {
        format!(
            "{}.{}.{}@{}",
            self.ids[0], self.ids[1], self.ids[2], self.node
        )
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#Ref<{}.{}.{}.{}>",
            self.node, self.ids[2], self.ids[1], self.ids[0]
        )
    }
}

/// How text is encoded in terms sent to peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// Character lists
    #[default]
    String,
    /// Binaries
    Binary,
}

/// A term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Atom(String),
    Integer(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Term>),
    Tuple(Vec<Term>),
    Pid(Pid),
    Ref(Ref),
}

impl Term {
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    pub fn tuple(elements: Vec<Term>) -> Self {
        Term::Tuple(elements)
    }

    pub fn list(elements: Vec<Term>) -> Self {
        Term::List(elements)
    }

    /// The empty list
    pub fn nil() -> Self {
        Term::List(Vec::new())
    }

    /// Text in the configured encoding
    pub fn text(value: impl Into<String>, encoding: StringEncoding) -> Self {
        match encoding {
            StringEncoding::String => Term::String(value.into()),
            StringEncoding::Binary => Term::Binary(value.into().into_bytes()),
        }
    }

    /// `ok`
    pub fn ok() -> Self {
        Term::atom("ok")
    }

    /// `{ok, Value}`
    pub fn ok_with(value: Term) -> Self {
        Term::tuple(vec![Term::atom("ok"), value])
    }

    /// `{error, Reason}`
    pub fn error(reason: &str) -> Self {
        Term::tuple(vec![Term::atom("error"), Term::atom(reason)])
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_atom(&self, name: &str) -> bool {
        self.as_atom() == Some(name)
    }

    /// Text carried as a string, a binary, or a list of character codes
    pub fn as_text(&self) -> Option<String> {
        match self {
            Term::String(s) => Some(s.clone()),
            Term::Binary(bytes) => String::from_utf8(bytes.clone()).ok(),
            Term::List(items) => items
                .iter()
                .map(|item| match item {
                    Term::Integer(code) => u32::try_from(*code).ok().and_then(char::from_u32),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Atom name or text, whichever the peer chose to send
    pub fn as_name(&self) -> Option<String> {
        match self {
            Term::Atom(name) => Some(name.clone()),
            other => other.as_text(),
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            // "" travels as an empty list, so an empty string is also an empty list
            Term::String(s) if s.is_empty() => Some(&[]),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<&Pid> {
        match self {
            Term::Pid(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<&Ref> {
        match self {
            Term::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Term::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<Pid> for Term {
    fn from(pid: Pid) -> Self {
        Term::Pid(pid)
    }
}

impl From<Ref> for Term {
    fn from(r: Ref) -> Self {
        Term::Ref(r)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }

        match self {
            Term::Atom(name) => write!(f, "{}", name),
            Term::Integer(i) => write!(f, "{}", i),
            Term::Float(x) => write!(f, "{}", x),
            Term::String(s) => write!(f, "{:?}", s),
            Term::Binary(bytes) => write!(f, "<<{:?}>>", String::from_utf8_lossy(bytes)),
            Term::List(items) => {
                write!(f, "[")?;
                join(f, items)?;
                write!(f, "]")
            }
            Term::Tuple(items) => {
                write!(f, "{{")?;
                join(f, items)?;
                write!(f, "}}")
            }
            Term::Pid(pid) => write!(f, "{}", pid),
            Term::Ref(r) => write!(f, "{}", r),
        }
    }
}
