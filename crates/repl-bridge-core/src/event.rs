//! Protocol records and caller-facing output events.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifier binding a request to the records it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh id (32 lowercase hex digits).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an id read back from the wire.
    #[must_use]
    pub fn from_wire(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type tag of a side-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Output,
    Message,
    Warning,
    Error,
    Plot,
    Html,
    CellStart,
    CellEnd,
}

impl RecordType {
    /// Wire tag as written by the session-side helper.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Message => "MESSAGE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Plot => "PLOT",
            Self::Html => "HTML",
            Self::CellStart => "CELL_START",
            Self::CellEnd => "CELL_END",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "OUTPUT" => Self::Output,
            "MESSAGE" => Self::Message,
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "PLOT" => Self::Plot,
            "HTML" => Self::Html,
            "CELL_START" => Self::CellStart,
            "CELL_END" => Self::CellEnd,
            _ => return None,
        })
    }
}

/// A framed unit of raw captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub id: CorrelationId,
    pub content: String,
}

impl Record {
    #[must_use]
    pub fn new(kind: RecordType, id: CorrelationId, content: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            content: content.into(),
        }
    }
}

/// Kind of a caller-facing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Message,
    Warning,
    Error,
    Image,
    Markup,
}

/// Event content: text or a binary payload with its media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum EventPayload {
    Text {
        text: String,
    },
    Binary {
        media_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

/// The typed result unit delivered to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub kind: EventKind,
    pub request_id: CorrelationId,
    pub payload: EventPayload,
}

impl OutputEvent {
    /// Create a textual event.
    #[must_use]
    pub fn text(kind: EventKind, request_id: CorrelationId, text: impl Into<String>) -> Self {
        Self {
            kind,
            request_id,
            payload: EventPayload::Text { text: text.into() },
        }
    }

    /// Create an image event.
    #[must_use]
    pub fn image(request_id: CorrelationId, media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: EventKind::Image,
            request_id,
            payload: EventPayload::Binary {
                media_type: media_type.into(),
                data,
            },
        }
    }

    /// Text content, if this is a textual event.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text { text } => Some(text),
            EventPayload::Binary { .. } => None,
        }
    }

    /// Binary content, if this is an image event.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            EventPayload::Binary { data, .. } => Some(data),
            EventPayload::Text { .. } => None,
        }
    }
}

/// Capture wrapper selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Plain,
    Image,
    Markup,
}

impl CaptureMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Image => "image",
            Self::Markup => "markup",
        }
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "image" | "plot" => Ok(Self::Image),
            "markup" | "html" => Ok(Self::Markup),
            other => Err(format!("unknown capture mode: {other}")),
        }
    }
}

/// Which diagnostic kinds reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationPolicy {
    pub show_messages: bool,
    pub show_warnings: bool,
    pub show_errors: bool,
}

impl Default for PresentationPolicy {
    fn default() -> Self {
        Self {
            show_messages: true,
            show_warnings: true,
            show_errors: true,
        }
    }
}

impl PresentationPolicy {
    /// Text, image and markup events always pass.
    #[must_use]
    pub const fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Message => self.show_messages,
            EventKind::Warning => self.show_warnings,
            EventKind::Error => self.show_errors,
            EventKind::Text | EventKind::Image | EventKind::Markup => true,
        }
    }

    /// Drop excluded events, preserving order.
    #[must_use]
    pub fn apply(&self, events: Vec<OutputEvent>) -> Vec<OutputEvent> {
        events.into_iter().filter(|e| self.allows(e.kind)).collect()
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
