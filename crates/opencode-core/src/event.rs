//! Live events published on the server's event stream.
//!
//! Every frame is a JSON envelope `{type, properties}`. The `type` tag selects
//! the variant the properties are decoded into; tags this crate does not know
//! decode into [`Event::Unknown`] with the properties left untouched, so new
//! server-side event kinds never fail a decode.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::{MessageInfo, Part, Session, SessionStatus};

const SERVER_CONNECTED: &str = "server.connected";
const MESSAGE_UPDATED: &str = "message.updated";
const MESSAGE_PART_UPDATED: &str = "message.part.updated";
const SESSION_UPDATED: &str = "session.updated";
const SESSION_STATUS: &str = "session.status";

/// Event decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("Malformed properties for '{kind}' event: {source}")]
    Properties {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A decoded live event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// First frame after the stream is opened.
    ServerConnected,
    /// A message was created or its metadata changed.
    MessageUpdated { info: MessageInfo },
    /// A part was created or updated. `delta` carries the newly streamed text
    /// when the server sends incremental updates.
    MessagePartUpdated { part: Part, delta: Option<String> },
    /// Session metadata changed (title, version, ...).
    SessionUpdated { info: Session },
    /// A session moved between idle and busy.
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    /// Any other tag, with its raw properties.
    Unknown { kind: String, properties: Value },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
struct PartProps {
    part: Part,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct StatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: SessionStatus,
}

impl Event {
    /// Decode one frame payload.
    ///
    /// # Errors
    /// Returns error if the envelope is not valid JSON, or if the properties
    /// of a known event kind do not match that kind's shape.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let Envelope { kind, properties } =
            serde_json::from_slice(data).map_err(DecodeError::Envelope)?;

        let event = match kind.as_str() {
            SERVER_CONNECTED => Self::ServerConnected,
            MESSAGE_UPDATED => {
                let props: InfoProps<MessageInfo> = properties_of(&kind, properties)?;
                Self::MessageUpdated { info: props.info }
            }
            MESSAGE_PART_UPDATED => {
                let props: PartProps = properties_of(&kind, properties)?;
                Self::MessagePartUpdated {
                    part: props.part,
                    delta: props.delta,
                }
            }
            SESSION_UPDATED => {
                let props: InfoProps<Session> = properties_of(&kind, properties)?;
                Self::SessionUpdated { info: props.info }
            }
            SESSION_STATUS => {
                let props: StatusProps = properties_of(&kind, properties)?;
                Self::SessionStatusChanged {
                    session_id: props.session_id,
                    status: props.status,
                }
            }
            _ => Self::Unknown { kind, properties },
        };
        Ok(event)
    }

    /// The wire tag of this event.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ServerConnected => SERVER_CONNECTED,
            Self::MessageUpdated { .. } => MESSAGE_UPDATED,
            Self::MessagePartUpdated { .. } => MESSAGE_PART_UPDATED,
            Self::SessionUpdated { .. } => SESSION_UPDATED,
            Self::SessionStatusChanged { .. } => SESSION_STATUS,
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// The session this event concerns, when it concerns one.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::MessageUpdated { info } => Some(&info.session_id),
            Self::MessagePartUpdated { part, .. } => Some(&part.session_id),
            Self::SessionUpdated { info } => Some(&info.id),
            Self::SessionStatusChanged { session_id, .. } => Some(session_id),
            Self::ServerConnected | Self::Unknown { .. } => None,
        }
    }
}

fn properties_of<T: DeserializeOwned>(kind: &str, properties: Value) -> Result<T, DecodeError> {
    serde_json::from_value(properties).map_err(|source| DecodeError::Properties {
        kind: kind.to_string(),
        source,
    })
}
