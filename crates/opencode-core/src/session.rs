//! Sessions and their live status.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A unit of conversational state on the server.
///
/// Sessions are created server-side and referenced by `id` afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(rename = "projectID", default)]
    pub project_id: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version: String,
}

impl Session {
    /// Whether this session was forked from another one.
    #[must_use]
    pub const fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Status reported by `session.status` events.
///
/// `kind` is `"idle"`, `"busy"`, `"retry"` and so on. Any extra fields the
/// server attaches (retry attempt, next retry time) are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionStatus {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.kind == "idle"
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.kind == "busy"
    }
}
