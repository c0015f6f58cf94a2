//! Data model for the opencode server protocol.
//!
//! This crate provides:
//! - `Session` - Server-side conversational state
//! - `Message`, `MessageInfo`, `Part` - Messages and their ordered parts
//! - `Event` - Closed set of live events with an open fallback variant

pub mod event;
pub mod message;
pub mod session;

pub use event::{DecodeError, Event};
pub use message::{Message, MessageInfo, MessagePart, Part, PartKind, Role, TextPartInput, Tokens};
pub use session::{Session, SessionStatus};
