//! Transport seam between the session core and the wire protocol.
//!
//! [`Connector`] opens authenticated transports; [`Transport`] is one open
//! connection offering command execution and positioned file I/O. The SSH
//! implementation lives in `client`; tests plug in an in-memory fake.
//!
//! Transports take `&mut self`: callers hold the per-session lock, so a
//! transport is never driven from two call sites at once.

use std::time::Duration;

use async_trait::async_trait;

use super::error::RemoteError;
use super::types::ConnectionRecord;

/// Credential material resolved from the credential store for one connect.
///
/// Lives only for the duration of the handshake.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    KeyFile {
        path: std::path::PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile { path, .. } => write!(f, "KeyFile({:?})", path),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the remote side reported no exit status
    pub exit_code: i32,
}

/// Opens authenticated transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish and authenticate a transport to `record.hostname`.
    ///
    /// Implementations bound the TCP/SSH handshake by `timeout` and must not
    /// leave anything open on failure.
    async fn open(
        &self,
        record: &ConnectionRecord,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, RemoteError>;
}

/// One open, authenticated connection.
#[async_trait]
pub trait Transport: Send {
    /// Run a command over the exec channel.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, RemoteError>;

    /// Lightweight round-trip proving the host answers.
    async fn probe(&mut self) -> Result<(), RemoteError>;

    /// Size in bytes of a remote file.
    async fn remote_size(&mut self, path: &str) -> Result<u64, RemoteError>;

    /// Read up to `len` bytes of a remote file starting at `offset`.
    ///
    /// Returns fewer bytes only at end of file.
    async fn read_at(&mut self, path: &str, offset: u64, len: usize)
    -> Result<Vec<u8>, RemoteError>;

    /// Write `data` into a remote file at `offset`.
    ///
    /// Offset 0 creates or truncates the file.
    async fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), RemoteError>;

    /// Whether the underlying connection is already gone.
    fn is_closed(&self) -> bool;

    /// Release the connection. Idempotent.
    async fn close(&mut self);
}
