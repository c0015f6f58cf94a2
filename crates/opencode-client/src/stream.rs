//! Event stream reader.
//!
//! The server publishes a server-sent-event feed. Each `data:` line carries
//! one JSON envelope which is decoded into an [`Event`] and handed to the
//! caller's handler on the reading task, in arrival order. The handler runs
//! inline: a slow handler slows the reader down.

use std::{borrow::Cow, io};

use futures::TryStreamExt;
use opencode_core::Event;
use reqwest::{Method, header::ACCEPT};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::{io::StreamReader, sync::CancellationToken};

use crate::client::{ApiClient, ClientError};

/// Largest accepted line, terminator included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const DATA_MARKER: &[u8] = b"data:";

/// Bytes of a rejected frame included in the warning.
const PREVIEW_BYTES: usize = 256;

/// Stream-fatal error.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Event stream read failed: {0}")]
    Read(#[from] io::Error),
    #[error("Event frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

impl ApiClient {
    /// Open the event stream and deliver every decoded event to `handler`.
    ///
    /// Returns `Ok(())` when the server ends the stream or `cancel` fires.
    /// Malformed frames are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the stream cannot be opened, the server answers with
    /// a non-2xx status, or the connection fails mid-stream.
    pub async fn stream_events<F>(
        &self,
        cancel: &CancellationToken,
        handler: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(Event),
    {
        tracing::info!("Starting event stream");
        let request = self
            .request(Method::GET, &["event"])?
            .header(ACCEPT, "text/event-stream");

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!("Event stream cancelled before connecting");
                return Ok(());
            }
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), "Unexpected status code opening event stream");
            return Err(ClientError::HttpStatus {
                code: status.as_u16(),
            });
        }
        tracing::info!("Event stream connected");

        let body = StreamReader::new(Box::pin(
            response.bytes_stream().map_err(io::Error::other),
        ));
        read_events(BufReader::new(body), cancel, handler).await?;
        Ok(())
    }
}

/// Read frames from `reader` until end of input or cancellation.
///
/// # Errors
/// Returns error if the reader fails or a line exceeds [`MAX_FRAME_BYTES`].
pub async fn read_events<R, F>(
    mut reader: R,
    cancel: &CancellationToken,
    mut handler: F,
) -> Result<(), StreamError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Event),
{
    let mut line = Vec::with_capacity(4096);

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!("Event stream cancelled");
                return Ok(());
            }
            read = next_line(&mut reader, &mut line) => read,
        };

        match read {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "Event stream error");
                return Err(e);
            }
        }

        let Some(data) = data_payload(&line) else {
            continue;
        };

        match Event::decode(data) {
            Ok(event) => {
                tracing::debug!(kind = event.kind(), "Received event");
                handler(event);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    len = data.len(),
                    data = %preview(data),
                    "Skipping malformed event frame"
                );
            }
        }
    }

    tracing::info!("Event stream ended");
    Ok(())
}

async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, StreamError>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader)
        .take(MAX_FRAME_BYTES as u64)
        .read_until(b'\n', buf)
        .await?;

    if read == MAX_FRAME_BYTES && buf.last() != Some(&b'\n') && !reader.fill_buf().await?.is_empty()
    {
        return Err(StreamError::FrameTooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(read)
}

/// Payload of a `data:` line, without the line terminator.
fn data_payload(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let data = line.strip_prefix(DATA_MARKER)?;
    let data = data.strip_prefix(b" ").unwrap_or(data);
    (!data.is_empty()).then_some(data)
}

fn preview(data: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(&data[..data.len().min(PREVIEW_BYTES)])
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    async fn collect(input: &[u8]) -> (Result<(), StreamError>, Vec<Event>) {
        let mut events = Vec::new();
        let result = read_events(input, &CancellationToken::new(), |e| events.push(e)).await;
        (result, events)
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload(b"data: {}\n"), Some(&b"{}"[..]));
        assert_eq!(data_payload(b"data:{}\r\n"), Some(&b"{}"[..]));
        assert_eq!(data_payload(b"event: message\n"), None);
        assert_eq!(data_payload(b": keepalive\n"), None);
        assert_eq!(data_payload(b"data: \n"), None);
        assert_eq!(data_payload(b"\n"), None);
    }

    #[test]
    fn test_preview_is_bounded() {
        assert_eq!(preview(b"{\"type\":"), "{\"type\":");
        let big = vec![b'x'; MAX_FRAME_BYTES];
        assert_eq!(preview(&big).len(), PREVIEW_BYTES);
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let input = b"data: {\"type\":\"server.connected\",\"properties\":{}}\n\n\
            : comment\n\
            event: message\n\
            data: {\"type\":\"session.status\",\"properties\":{\"sessionID\":\"s1\",\"status\":{\"type\":\"busy\"}}}\r\n\r\n\
            data: {\"type\":\"some.future.kind\",\"properties\":{\"x\":1}}\n\n";
        let (result, events) = collect(input).await;
        result.unwrap();
        let kinds: Vec<&str> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, ["server.connected", "session.status", "some.future.kind"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let input = b"data: {\"type\":\"server.connected\"}\n\
            data: {broken\n\
            data: {\"type\":\"session.status\",\"properties\":{\"status\":{}}}\n\
            data: {\"type\":\"lsp.updated\",\"properties\":{}}\n";
        let (result, events) = collect(input).await;
        result.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind(), "lsp.updated");
    }

    #[tokio::test]
    async fn test_last_line_without_newline() {
        let (result, events) = collect(b"data: {\"type\":\"server.connected\"}").await;
        result.unwrap();
        assert_eq!(events, [Event::ServerConnected]);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let mut input = b"data: {\"type\":\"server.connected\"}\n".to_vec();
        input.extend_from_slice(b"data: ");
        input.extend(std::iter::repeat_n(b'a', MAX_FRAME_BYTES));
        input.extend_from_slice(b"\ndata: {\"type\":\"server.connected\"}\n");

        let (result, events) = collect(&input).await;
        assert!(matches!(
            result,
            Err(StreamError::FrameTooLarge { limit: MAX_FRAME_BYTES })
        ));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_large_frame_under_limit() {
        let listing = "f".repeat(MAX_FRAME_BYTES / 2);
        let frame = json!({ "type": "file.listing", "properties": { "files": listing } });
        let input = format!("data: {frame}\n");
        let (result, events) = collect(input.as_bytes()).await;
        result.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let mock = tokio_test::io::Builder::new()
            .read(b"data: {\"type\":\"server.connected\"}\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut count = 0;
        let result = read_events(BufReader::new(mock), &CancellationToken::new(), |_| count += 1).await;
        assert!(matches!(result, Err(StreamError::Read(_))));
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_reading() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut count = 0;
        read_events(
            &b"data: {\"type\":\"server.connected\"}\n"[..],
            &cancel,
            |_| count += 1,
        )
        .await
        .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_stream_events_over_http() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/event")
                    .query_param("directory", "/tmp/isolated");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
                        "data: {\"type\":\"session.updated\",\"properties\":{\"info\":{\"id\":\"s1\",\"title\":\"t\"}}}\n\n",
                    ));
            })
            .await;

        let client = ApiClient::new(server.address().to_string()).with_directory("/tmp/isolated");
        let mut events = Vec::new();
        client
            .stream_events(&CancellationToken::new(), |e| events.push(e))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].session_id(), Some("s1"));
    }

    #[tokio::test]
    async fn test_stream_events_status_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/event");
                then.status(404);
            })
            .await;

        let client = ApiClient::new(server.address().to_string());
        let err = client
            .stream_events(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus { code: 404 }));
    }
}
