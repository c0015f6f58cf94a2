//! Messages and message parts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// A role this client does not know about yet.
    #[serde(other)]
    Other,
}

/// Token accounting reported for assistant turns and step parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheTokens,
}

/// Cache read/write token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Working paths an assistant turn ran against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePath {
    pub cwd: String,
    pub root: String,
}

/// Metadata of a single message, user or assistant.
///
/// The assistant-only fields are `None` on user messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: Role,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<MessagePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Tokens>,
    /// Finish reason: `"stop"`, `"length"`, `"error"`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
}

impl MessageInfo {
    /// Whether the assistant turn has finished.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.time.completed.is_some()
    }
}

/// Type tag of a message part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PartKind {
    Text,
    Tool,
    Reasoning,
    File,
    StepStart,
    StepFinish,
    Snapshot,
    Patch,
    Agent,
    Other(String),
}

impl PartKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Tool => "tool",
            Self::Reasoning => "reasoning",
            Self::File => "file",
            Self::StepStart => "step-start",
            Self::StepFinish => "step-finish",
            Self::Snapshot => "snapshot",
            Self::Patch => "patch",
            Self::Agent => "agent",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for PartKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text" => Self::Text,
            "tool" => Self::Tool,
            "reasoning" => Self::Reasoning,
            "file" => Self::File,
            "step-start" => Self::StepStart,
            "step-finish" => Self::StepFinish,
            "snapshot" => Self::Snapshot,
            "patch" => Self::Patch,
            "agent" => Self::Agent,
            _ => Self::Other(value),
        }
    }
}

impl From<PartKind> for String {
    fn from(kind: PartKind) -> Self {
        match kind {
            PartKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTime {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// One ordered piece of a message: text, a tool call, reasoning, a step marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    /// Set on `step-finish` parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Tokens>,
}

/// Alias used where a part is discussed as part of a message.
pub type MessagePart = Part;

impl Part {
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.kind == PartKind::Text
    }
}

/// A message together with its parts, as returned by the message endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Message {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.info.role
    }

    /// Concatenated body of all text parts, in order.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.is_text())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

/// Request body part for sending a text prompt.
#[derive(Debug, Clone, Serialize)]
pub struct TextPartInput<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

impl<'a> TextPartInput<'a> {
    #[must_use]
    pub const fn new(text: &'a str) -> Self {
        Self { kind: "text", text }
    }
}
