//! Container engine API client
//!
//! The engine is reached over its Unix socket with plain HTTP/1.1. Streaming
//! responses are not decoded here: the socket is handed back right after the
//! response head so the reactor can run the chunked bytes through the frame
//! codec itself.

use crate::codec::ChunkDecoder;
use crate::models::{ContainerInfo, ContainerSummary};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Daemon-wide event feed
pub const EVENTS_PATH: &str = "/events";

/// Default bound on connecting and reading a response head
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a response head
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Headers kept from one response
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{path}: not found")]
    NotFound { path: String },

    #[error("{path}: engine answered {code} {reason}")]
    Status {
        path: String,
        code: u16,
        reason: String,
    },

    #[error("failed to connect to engine socket `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error talking to the engine: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: no answer from the engine within {after:?}")]
    Timeout { path: String, after: Duration },

    #[error("malformed engine response: {0}")]
    MalformedResponse(String),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// The container vanished while we were talking about it
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

/// An open streaming response, positioned right after its head
pub struct StreamHandle {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Body bytes that arrived together with the head
    pub initial: Vec<u8>,
    /// Whether the body uses chunked transfer encoding
    pub chunked: bool,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("initial", &self.initial.len())
            .field("chunked", &self.chunked)
            .finish_non_exhaustive()
    }
}

/// Capabilities the agent needs from the container engine
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Currently running containers
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Inspection metadata; `NotFound` once the container is gone
    async fn inspect(&self, id: &str) -> Result<ContainerInfo, EngineError>;

    /// Issue a streaming GET and return once the response head is read
    async fn open_stream(&self, path: &str) -> Result<StreamHandle, EngineError>;
}

/// Follow a container's stdout and stderr with timestamps, optionally
/// starting at `since` (epoch seconds).
pub fn logs_path(id: &str, since: Option<i64>) -> String {
    match since {
        Some(since) => format!(
            "/containers/{id}/logs?follow=1&stdout=1&stderr=1&since={since}&timestamps=1"
        ),
        None => format!("/containers/{id}/logs?follow=1&stdout=1&stderr=1&timestamps=1"),
    }
}

pub fn stats_path(id: &str) -> String {
    format!("/containers/{id}/stats")
}

/// Status line and headers of an HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Map non-200 statuses to errors
    fn check(&self, path: &str) -> Result<(), EngineError> {
        match self.status {
            200 => Ok(()),
            404 => Err(EngineError::NotFound {
                path: path.to_string(),
            }),
            code => Err(EngineError::Status {
                path: path.to_string(),
                code,
                reason: self.reason.clone(),
            }),
        }
    }
}

/// Parse a response head at the start of `raw`. Returns the head and its
/// length including the blank line, or `None` while the head is incomplete.
pub fn parse_response_head(raw: &[u8]) -> Result<Option<(ResponseHead, usize)>, EngineError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(raw) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(EngineError::MalformedResponse(format!("bad response head: {e}"))),
    };

    let status = response
        .code
        .ok_or_else(|| EngineError::MalformedResponse("missing status code".into()))?;
    let head = ResponseHead {
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect(),
    };
    Ok(Some((head, len)))
}

/// Read until the end of the response head. Returns the head and any body
/// bytes that were read past it.
async fn read_head<R>(reader: &mut R) -> Result<(ResponseHead, Vec<u8>), EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut scratch = [0u8; 1024];
    loop {
        if let Some((head, len)) = parse_response_head(&buf)? {
            let rest = buf.split_off(len);
            return Ok((head, rest));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(EngineError::MalformedResponse(
                "response head too large".into(),
            ));
        }
        let n = reader.read(&mut scratch).await?;
        if n == 0 {
            return Err(EngineError::MalformedResponse(
                "connection closed before response head".into(),
            ));
        }
        buf.extend_from_slice(&scratch[..n]);
    }
}

/// Engine client over a Unix domain socket
#[derive(Debug, Clone)]
pub struct UnixEngine {
    socket_path: PathBuf,
    timeout: Duration,
}

impl UnixEngine {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound connecting plus reading the response head (and the body of
    /// JSON calls).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        path: &str,
        request: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| EngineError::Timeout {
                path: path.to_string(),
                after: self.timeout,
            })?
    }

    async fn send_request(
        &self,
        path: &str,
        close: bool,
    ) -> Result<(ResponseHead, Vec<u8>, UnixStream), EngineError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| EngineError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let connection = if close { "Connection: close\r\n" } else { "" };
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{connection}\r\n");
        stream.write_all(request.as_bytes()).await?;

        let (head, rest) = read_head(&mut stream).await?;
        debug!(path = %path, status = head.status, "Engine response");
        head.check(path)?;
        Ok((head, rest, stream))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &'static str,
    ) -> Result<T, EngineError> {
        let (head, mut body) = self
            .bounded(path, async {
                let (head, mut body, mut stream) = self.send_request(path, true).await?;
                stream.read_to_end(&mut body).await?;
                Ok((head, body))
            })
            .await?;

        let body = if head.is_chunked() {
            let mut decoder = ChunkDecoder::new();
            decoder.feed(&body).concat()
        } else {
            if let Some(len) = head.content_length() {
                body.truncate(len);
            }
            body
        };

        serde_json::from_slice(&body).map_err(|source| EngineError::Decode { what, source })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    created: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspection {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    config: InspectionConfig,
    #[serde(default)]
    state: InspectionState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectionConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    tty: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectionState {
    #[serde(default)]
    started_at: String,
}

impl From<Inspection> for ContainerInfo {
    fn from(raw: Inspection) -> Self {
        ContainerInfo {
            id: raw.id,
            name: raw.name,
            image: raw.config.image,
            image_id: raw.image,
            cmd: raw.config.cmd.unwrap_or_default(),
            tty: raw.config.tty,
            started_at: raw.state.started_at,
        }
    }
}

#[async_trait]
impl Engine for UnixEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let entries: Vec<ListEntry> = self.get_json("/containers/json", "container list").await?;
        Ok(entries
            .into_iter()
            .map(|e| ContainerSummary {
                id: e.id,
                created: e.created,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let raw: Inspection = self
            .get_json(&format!("/containers/{id}/json"), "container inspection")
            .await?;
        Ok(raw.into())
    }

    async fn open_stream(&self, path: &str) -> Result<StreamHandle, EngineError> {
        let (head, initial, stream) = self
            .bounded(path, self.send_request(path, false))
            .await?;
        Ok(StreamHandle {
            reader: Box::new(stream),
            initial,
            chunked: head.is_chunked(),
        })
    }
}
