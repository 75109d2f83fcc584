//! Serializable data types shared by the remote core and the tool surface.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` so they
//! can be persisted and returned as structured tool content.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::transfer::TransferInfo;

/// How a connection authenticates. Secrets themselves never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Password kept in the OS credential store under `secret_id`.
    Password { secret_id: String },
    /// Private key file, with an optional passphrase kept in the credential store.
    KeyFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase_secret_id: Option<String>,
    },
    /// Identities offered by the running SSH agent.
    Agent,
}

impl CredentialRef {
    /// Secret ids this reference owns in the credential store.
    pub fn secret_ids(&self) -> Vec<&str> {
        match self {
            CredentialRef::Password { secret_id } => vec![secret_id.as_str()],
            CredentialRef::KeyFile {
                passphrase_secret_id: Some(id),
                ..
            } => vec![id.as_str()],
            _ => Vec::new(),
        }
    }
}

/// A named, manageable host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionRecord {
    /// Unique key
    pub name: String,
    /// Hostname or IP, optionally with `:port`
    pub hostname: String,
    pub username: String,
    pub credential: CredentialRef,
    /// Whether the record is persisted to the connection store
    #[serde(default = "default_saved")]
    pub saved: bool,
}

fn default_saved() -> bool {
    true
}

/// Lifecycle of one remote session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal for this instance; recovery needs a fresh connect
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

/// Session metadata snapshot
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub state: SessionState,
    /// When the session was established (RFC3339 format)
    pub connected_at: String,
    /// Last successful round-trip (RFC3339 format)
    pub last_activity: String,
    /// Number of retry attempts needed to establish the connection
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectResponse {
    pub name: String,
    pub message: String,
    /// True when an already-live session was reused
    pub reused: bool,
    pub retry_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DisconnectResponse {
    pub name: String,
    /// Whether a session actually existed
    pub disconnected: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DisconnectAllResponse {
    pub disconnected: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionResponse {
    pub connection: ConnectionRecord,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TransferListResponse {
    pub transfers: Vec<TransferInfo>,
    pub count: usize,
    /// Finished transfers forgotten after this listing
    pub cleared: usize,
}
