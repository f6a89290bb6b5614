//! Wire protocol frames exchanged with the sandbox service.
//!
//! The service speaks a request/response + push-stream protocol over a
//! single duplex connection. Every request carries a correlation id; the
//! server answers with exactly one `Response` frame per request and, for
//! executions, any number of `Chunk` frames before it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Correlation id for one request, unique per transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an execution request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecKind {
    /// A code snippet for the sandbox's language runtime.
    Code,
    /// A shell command with arguments.
    Command,
}

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

// =============================================================================
// Client → Server
// =============================================================================

/// One frame sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlation id; the matching response carries the same id.
    pub id: RequestId,

    /// Sandbox the request is addressed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,

    #[serde(flatten)]
    pub body: RequestBody,
}

/// Request payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestBody {
    /// Provision a sandbox from a base image inside a namespace.
    CreateSandbox {
        image: String,
        env: Vec<String>,
        namespace: String,
    },

    /// Run code or a command; output arrives as `Chunk` frames.
    Execute {
        kind: ExecKind,
        payload: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },

    /// Tear the sandbox down and release its resources.
    DestroySandbox,

    /// Best-effort cancellation of an in-flight request.
    Abort { target: RequestId },

    /// Read a file from the sandbox filesystem namespace.
    ReadFile { path: String },

    /// Write a file into the sandbox filesystem namespace (base64 payload).
    WriteFile { path: String, data: String },

    /// List a directory in the sandbox filesystem namespace.
    ListFiles { path: String },
}

// =============================================================================
// Server → Client
// =============================================================================

/// One frame received from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The terminal answer to a request.
    Response(ResponseFrame),
    /// One ordered piece of streamed output for an execution.
    Chunk(OutputChunk),
}

/// Terminal answer to a request: either a body or a remote error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: RequestId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<ResponseBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ResponseFrame {
    /// Successful response.
    pub fn success(id: RequestId, body: ResponseBody) -> Self {
        Self {
            id,
            ok: Some(body),
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(id: RequestId, error: RemoteError) -> Self {
        Self {
            id,
            ok: None,
            error: Some(error),
        }
    }

    /// Collapse the frame into a result, treating a frame with neither
    /// body nor error as a protocol violation.
    pub fn into_result(self) -> Result<ResponseBody> {
        match (self.ok, self.error) {
            (Some(body), None) => Ok(body),
            (_, Some(err)) => Err(Error::remote(err.code, err.message)),
            (None, None) => Err(Error::protocol(format!(
                "response {} carried neither body nor error",
                self.id
            ))),
        }
    }
}

/// Error reported by the server for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

/// Response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// The sandbox is provisioned and ready.
    Created { sandbox: String },

    /// The execution terminated; all of its chunks have been sent.
    ExecFinished { exit_code: i64 },

    /// File contents, base64-encoded.
    FileContents { data: String },

    /// Directory listing.
    Entries { entries: Vec<FileEntry> },

    /// Plain acknowledgment (destroy, write, abort).
    Ack,
}

/// One entry in a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub directory: bool,
}

/// One ordered piece of streamed stdout/stderr data.
///
/// Sequence numbers are gap-free from 0 per `(request_id, stream)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub request_id: RequestId,
    pub stream: StreamKind,
    pub seq: u64,
    pub data: String,
}

// =============================================================================
// Tests
// =============================================================================
