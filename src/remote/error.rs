//! Error taxonomy for remote sessions, fan-out and transfers.
//!
//! Every failure the core can surface is a [`RemoteError`]. The variants map
//! one-to-one onto what an operator needs to know:
//!
//! - **Auth**: the host rejected the credentials. Never retried.
//! - **Network**: the host is unreachable, refused or dropped the connection.
//! - **Timeout**: a handshake or an operation exceeded its bound.
//! - **RemoteExec**: the remote command ran and reported failure. The remote
//!   text is kept verbatim.
//! - **SessionClosed**: the call targeted a session that is gone.
//! - **Io**: local or remote file I/O during a transfer.
//!
//! # Classification Strategy
//!
//! The SSH library reports most failures as free-form strings. Those strings
//! are classified by keyword tables:
//!
//! 1. **Authentication failures** are checked first and take precedence. An
//!    error mentioning both a timeout and "authentication failed" is an auth
//!    error, so it is never retried and cannot lock out an account.
//! 2. **Timeouts** are recognised next.
//! 3. Everything else that reached the transport is a network error.
//!
//! # Examples
//!
//! ```rust,ignore
//! use winadmin_remote::remote::error::is_retryable_message;
//!
//! assert!(!is_retryable_message("Permission denied"));
//! assert!(is_retryable_message("Connection refused"));
//! assert!(!is_retryable_message("SSH protocol error"));
//! assert!(is_retryable_message("SSH connection timeout"));
//! ```

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication failure patterns that should NOT be retried.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "authentication rejected",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Patterns that mark a failure as a timeout rather than a plain network error.
const TIMEOUT_ERRORS: &[&str] = &["timeout", "timed out"];

/// Serializable discriminant of [`RemoteError`], used in per-host results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Network,
    Timeout,
    RemoteExec,
    SessionClosed,
    Io,
    InvalidRequest,
    UnknownConnection,
    DuplicateConnection,
    ConnectionActive,
    Credential,
    Store,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Auth => "auth_error",
            ErrorKind::Network => "network_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::RemoteExec => "remote_exec_error",
            ErrorKind::SessionClosed => "session_closed_error",
            ErrorKind::Io => "io_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnknownConnection => "unknown_connection",
            ErrorKind::DuplicateConnection => "duplicate_connection",
            ErrorKind::ConnectionActive => "connection_active",
            ErrorKind::Credential => "credential_error",
            ErrorKind::Store => "store_error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Errors raised by the remote core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Authentication to {host} failed: {reason}")]
    Auth { host: String, reason: String },

    #[error("Cannot reach {host}: {reason}")]
    Network { host: String, reason: String },

    #[error("{host}: {operation} timed out after {after:?}")]
    Timeout {
        host: String,
        operation: String,
        after: Duration,
    },

    #[error("{host}: remote command failed (exit code {exit_code}): {message}")]
    RemoteExec {
        host: String,
        exit_code: i32,
        message: String,
    },

    #[error("{host}: session is closed")]
    SessionClosed { host: String },

    #[error("{host}: I/O error: {reason}")]
    Io { host: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No connection named '{0}'")]
    UnknownConnection(String),

    #[error("A connection named '{0}' already exists")]
    DuplicateConnection(String),

    #[error("Connection '{0}' has a live session; disconnect it first")]
    ConnectionActive(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Connection store error: {0}")]
    Store(String),

    #[error("{host}: cancelled before dispatch")]
    Cancelled { host: String },
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Auth { .. } => ErrorKind::Auth,
            RemoteError::Network { .. } => ErrorKind::Network,
            RemoteError::Timeout { .. } => ErrorKind::Timeout,
            RemoteError::RemoteExec { .. } => ErrorKind::RemoteExec,
            RemoteError::SessionClosed { .. } => ErrorKind::SessionClosed,
            RemoteError::Io { .. } => ErrorKind::Io,
            RemoteError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RemoteError::UnknownConnection(_) => ErrorKind::UnknownConnection,
            RemoteError::DuplicateConnection(_) => ErrorKind::DuplicateConnection,
            RemoteError::ConnectionActive(_) => ErrorKind::ConnectionActive,
            RemoteError::Credential(_) => ErrorKind::Credential,
            RemoteError::Store(_) => ErrorKind::Store,
            RemoteError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Whether a connect attempt that failed this way is worth repeating.
    pub fn is_retryable_connect(&self) -> bool {
        match self {
            RemoteError::Network { reason, .. } => is_retryable_message(reason),
            RemoteError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether a transfer chunk that failed this way may be retried.
    ///
    /// Only I/O errors qualify: a closed session cannot recover.
    pub fn is_retryable_chunk(&self) -> bool {
        matches!(self, RemoteError::Io { .. })
    }

    pub fn session_closed(host: impl Into<String>) -> Self {
        RemoteError::SessionClosed { host: host.into() }
    }

    pub fn io(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RemoteError::Io {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(host: impl Into<String>, operation: impl Into<String>, after: Duration) -> Self {
        RemoteError::Timeout {
            host: host.into(),
            operation: operation.into(),
            after,
        }
    }
}

/// Determines if a raw transport message describes a transient failure.
///
/// # Classification Rules
///
/// 1. **Authentication failures are NOT retryable.**
/// 2. **Connection errors ARE retryable.**
/// 3. **Unknown errors**: not retried if they look like SSH protocol errors
///    (contain "ssh") unless they also mention "timeout" or "connect";
///    retried otherwise.
pub fn is_retryable_message(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("timeout") || error_lower.contains("connect")
}

/// Turn a raw transport failure message into a typed [`RemoteError`].
pub fn classify_transport_error(host: &str, message: &str, bound: Duration) -> RemoteError {
    let lower = message.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
        return RemoteError::Auth {
            host: host.to_string(),
            reason: message.to_string(),
        };
    }

    if TIMEOUT_ERRORS.iter().any(|p| lower.contains(p)) {
        return RemoteError::timeout(host, "connect", bound);
    }

    RemoteError::Network {
        host: host.to_string(),
        reason: message.to_string(),
    }
}
