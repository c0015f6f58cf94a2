//! Typed client for a running opencode server.
//!
//! Provides:
//! - `ApiClient` - Session and message operations plus health probing
//! - Event stream reader that decodes the live feed into `Event`s

pub mod client;
pub mod stream;

pub use client::{ApiClient, ClientError};
pub use stream::{MAX_FRAME_BYTES, StreamError, read_events};

pub use opencode_core::{Event, Message, Session};
pub use tokio_util::sync::CancellationToken;
