/// Internal events flowing from client sessions to the server and on to
/// rooms. An event carries the originating client and a text payload whose
/// meaning depends on the kind.
use std::fmt;
use std::sync::Arc;

use super::client::ClientHandle;

/// What an [`Event`] means to its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A client appeared (session start, or JOIN when sent to a room).
    New,
    /// A client went away (session end, or PART when sent to a room).
    Del,
    /// Topic query or change.
    Topic,
    /// WHO listing request.
    Who,
    /// Channel mode query or change.
    Mode,
    /// A raw protocol line (server), or `CMD payload` text (room).
    Msg,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::New => "NEW",
            EventKind::Del => "DEL",
            EventKind::Topic => "TOPIC",
            EventKind::Who => "WHO",
            EventKind::Mode => "MODE",
            EventKind::Msg => "MSG",
        };
        f.write_str(s)
    }
}

/// A tagged message between tasks. Consumed exactly once.
#[derive(Debug, Clone)]
pub struct Event {
    pub from: Arc<ClientHandle>,
    pub kind: EventKind,
    pub text: String,
}

impl Event {
    pub fn new(from: Arc<ClientHandle>, kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            from,
            kind,
            text: text.into(),
        }
    }
}
