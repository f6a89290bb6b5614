//! Error types for the Minibox SDK.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::RequestId;

/// Result type alias using the SDK's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the Minibox SDK.
///
/// Every failed call carries enough context (sandbox name, request id) to
/// correlate with server-side logs.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("sandbox {sandbox} is {state}; cannot {operation}")]
    InvalidState {
        sandbox: String,
        state: String,
        operation: &'static str,
    },

    #[error("sandbox {sandbox} already has an execution in flight (rejected request {request})")]
    Busy { sandbox: String, request: RequestId },

    #[error("sandbox {sandbox} release unconfirmed: {reason}")]
    ReleaseUncertain { sandbox: String, reason: String },

    // =========================================================================
    // Call Errors
    // =========================================================================
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    // =========================================================================
    // Lookup & Path Errors
    // =========================================================================
    #[error("no service named '{0}' is configured")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors reported by the transport layer.
///
/// The transport only reports; reconnect policy belongs to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The underlying connection was lost.
    #[error("connection to the sandbox service was lost")]
    Disconnected,

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The connection could not be established.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// The remote side violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Create an invalid-state error.
    pub fn invalid_state(
        sandbox: impl Into<String>,
        state: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            sandbox: sandbox.into(),
            state: state.to_string(),
            operation,
        }
    }

    /// Create a busy error for a rejected concurrent execution.
    pub fn busy(sandbox: impl Into<String>, request: RequestId) -> Self {
        Self::Busy {
            sandbox: sandbox.into(),
            request,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout {
            operation,
            after_ms: after.as_millis() as u64,
        }
    }

    /// Create a release-uncertain error for an unconfirmed teardown.
    pub fn release_uncertain(sandbox: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReleaseUncertain {
            sandbox: sandbox.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error for an orchestrator lookup miss.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create an invalid-path error.
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create a protocol-violation transport error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Transport(TransportError::Protocol(msg.into()))
    }

    /// Create an error from a remote error response.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }
}
