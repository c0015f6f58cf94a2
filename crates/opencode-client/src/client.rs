//! Session and message operations against a running server.

use std::{path::Path, time::Duration};

use opencode_core::{Message, Session, TextPartInput};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::stream::StreamError;

/// Health endpoint polled for readiness.
pub const HEALTH_PATH: &str = "/global/health";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Server address is not set")]
    MissingAddress,
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
    #[error("Unexpected status code: {code}")]
    HttpStatus { code: u16 },
    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Event stream error: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    parts: [TextPartInput<'a>; 1],
}

/// HTTP client bound to one server address.
///
/// The client is an immutable snapshot of the address and directory scope
/// it was built with; it is cheap to clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    addr: String,
    directory: Option<String>,
}

impl ApiClient {
    /// Create a client for `addr` (`host:port`). An empty address yields a
    /// client whose every operation fails with [`ClientError::MissingAddress`].
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_http_client(reqwest::Client::new(), addr)
    }

    /// Create a client that reuses an existing connection pool.
    #[must_use]
    pub fn with_http_client(http: reqwest::Client, addr: impl Into<String>) -> Self {
        Self {
            http,
            addr: addr.into(),
            directory: None,
        }
    }

    /// Scope session and event requests to `directory`.
    #[must_use]
    pub fn with_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.directory = Some(directory.as_ref().to_string_lossy().into_owned());
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[must_use]
    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    /// Full URL for `path`, or the empty string when no address is set.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        if self.addr.is_empty() {
            return String::new();
        }
        format!("http://{}{path}", self.addr)
    }

    /// URL of the endpoint made of `segments`, each percent-encoded as a
    /// single path segment.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        if self.addr.is_empty() {
            return Err(ClientError::MissingAddress);
        }
        let invalid = || ClientError::InvalidAddress(self.addr.clone());
        let mut url = Url::parse(&format!("http://{}/", self.addr)).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn request(
        &self,
        method: Method,
        segments: &[&str],
    ) -> Result<RequestBuilder, ClientError> {
        let mut request = self.http.request(method, self.endpoint(segments)?);
        if let Some(ref directory) = self.directory {
            request = request.query(&[("directory", directory)]);
        }
        Ok(request)
    }

    /// Probe the health endpoint once. Any HTTP response counts as healthy.
    ///
    /// # Errors
    /// Returns error if no address is set or the request fails in transport.
    pub async fn health(&self) -> Result<(), ClientError> {
        let url = self.url(HEALTH_PATH);
        if url.is_empty() {
            return Err(ClientError::MissingAddress);
        }
        let _response = self.http.get(url).timeout(HEALTH_TIMEOUT).send().await?;
        Ok(())
    }

    /// List sessions, most recent ordering as returned by the server.
    ///
    /// # Errors
    /// Returns error on transport failure, non-2xx status, or malformed body.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        tracing::info!("Listing sessions");
        let request = self.request(Method::GET, &["session"])?;
        let sessions: Vec<Session> = decode(request.send().await?, "list sessions").await?;
        tracing::info!(count = sessions.len(), "Sessions retrieved");
        Ok(sessions)
    }

    /// Create a session with the given title.
    ///
    /// # Errors
    /// Returns error on transport failure, non-2xx status, or malformed body.
    pub async fn create_session(&self, title: &str) -> Result<Session, ClientError> {
        tracing::info!(title, "Creating session");
        let request = self
            .request(Method::POST, &["session"])?
            .json(&CreateSessionBody { title });
        let session: Session = decode(request.send().await?, "create session").await?;
        tracing::info!(id = %session.id, title = %session.title, "Session created");
        Ok(session)
    }

    /// Send a text prompt to a session.
    ///
    /// The returned message is the persisted user message. The assistant's
    /// reply arrives later on the event stream.
    ///
    /// # Errors
    /// Returns error on transport failure, non-2xx status, or malformed body.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<Message, ClientError> {
        tracing::info!(session_id, "Sending message");
        let request = self
            .request(Method::POST, &["session", session_id, "message"])?
            .json(&SendMessageBody {
                parts: [TextPartInput::new(text)],
            });
        let message: Message = decode(request.send().await?, "send message").await?;
        tracing::info!(message_id = %message.id(), session_id, "Message sent");
        Ok(message)
    }
}

async fn decode<T: DeserializeOwned>(response: Response, op: &str) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        tracing::error!(status = status.as_u16(), op, "Unexpected status code");
        return Err(ClientError::HttpStatus {
            code: status.as_u16(),
        });
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| {
        tracing::error!(error = %e, op, "Failed to decode response");
        ClientError::Decode(e)
    })
}
