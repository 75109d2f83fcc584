//! SSH implementation of the transport seam.
//!
//! ## Connection Lifecycle
//!
//! 1. **Address Parsing**: `host:port`, defaulting to port 22.
//! 2. **Client Configuration**: keepalive and compression settings. Sessions
//!    are long-lived, so there is no inactivity timeout; liveness is tracked
//!    by keepalives and the session's own probes.
//! 3. **Connection Establishment**: TCP + SSH handshake bounded by the
//!    connect timeout.
//! 4. **Authentication**: an [`AuthChain`] built from the resolved
//!    [`Credential`]. Secrets go through the SSH auth exchange only, never
//!    through a command line.
//!
//! Commands run over a fresh exec channel each. File I/O runs over one SFTP
//! subsystem channel opened on first use and kept for the session lifetime.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::error::{RemoteError, classify_transport_error};
use super::transport::{Connector, Credential, ExecOutput, Transport};
use super::types::ConnectionRecord;

/// Client handler for russh that accepts all host keys.
///
/// # Security Note
///
/// Host keys are not verified (equivalent to `StrictHostKeyChecking=no`).
/// Managed hosts are operator-entered records on a trusted network.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build russh client configuration.
///
/// - No inactivity timeout: sessions stay open until disconnected
/// - Keepalive every 30 seconds, 3 missed keepalives close the connection
/// - ZLIB preferred when `compress` is set
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parse `host:port` or `host` (default port 22).
///
/// Uses `rsplit_once` so `[::1]:22` keeps its bracketed host.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), String> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {}", e))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

/// Build an authentication chain for a resolved credential.
fn build_auth_chain(credential: Credential) -> AuthChain {
    match credential {
        Credential::Password(password) => AuthChain::new().with_password(password),
        Credential::KeyFile { path, passphrase } => AuthChain::new().with_key(path, passphrase),
        Credential::Agent => AuthChain::new().with_agent(),
    }
}

/// Opens SSH transports.
pub struct SshConnector {
    compression: bool,
}

impl SshConnector {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        record: &ConnectionRecord,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, RemoteError> {
        let (host, port) = parse_address(&record.hostname).map_err(|e| {
            RemoteError::InvalidRequest(format!("{}: {}", record.hostname, e))
        })?;

        let config = build_client_config(self.compression);
        let connect_future = client::connect(config, (host.as_str(), port), SshClientHandler);

        let mut handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| RemoteError::timeout(&record.name, "connect", timeout))?
            .map_err(|e| {
                classify_transport_error(&record.name, &format!("Failed to connect: {}", e), timeout)
            })?;

        let chain = build_auth_chain(credential);
        let outcome = chain.authenticate(&mut handle, &record.username).await;

        let failure = match outcome {
            Ok(true) => {
                info!("Authenticated to {} as {}", record.hostname, record.username);
                return Ok(Box::new(SshTransport::new(record.name.clone(), handle)));
            }
            Ok(false) => RemoteError::Auth {
                host: record.name.clone(),
                reason: "no authentication methods succeeded".to_string(),
            },
            Err(e) if handle.is_closed() => {
                classify_transport_error(&record.name, &e, timeout)
            }
            Err(e) => RemoteError::Auth {
                host: record.name.clone(),
                reason: e,
            },
        };

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
            .await
        {
            debug!("Error closing rejected connection to {}: {}", record.hostname, e);
        }
        Err(failure)
    }
}

/// One authenticated SSH connection.
pub struct SshTransport {
    host: String,
    handle: client::Handle<SshClientHandler>,
    sftp: Option<SftpSession>,
}

impl SshTransport {
    fn new(host: String, handle: client::Handle<SshClientHandler>) -> Self {
        Self {
            host,
            handle,
            sftp: None,
        }
    }

    /// Map a failure on an open connection: a dead connection means the
    /// session is closed, anything else is plain I/O.
    fn io_error(&self, e: impl std::fmt::Display) -> RemoteError {
        if self.handle.is_closed() {
            RemoteError::session_closed(&self.host)
        } else {
            RemoteError::io(&self.host, e)
        }
    }

    async fn ensure_sftp(&mut self) -> Result<(), RemoteError> {
        if self.sftp.is_some() {
            return Ok(());
        }

        debug!("Opening SFTP subsystem on {}", self.host);
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.io_error(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.io_error(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.io_error(format!("SFTP init failed: {}", e)))?;

        self.sftp = Some(sftp);
        Ok(())
    }

    fn sftp(&self) -> Result<&SftpSession, RemoteError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| RemoteError::io(&self.host, "SFTP subsystem not open"))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, RemoteError> {
        let mut channel = self.handle.channel_open_session().await.map_err(|e| {
            if self.handle.is_closed() {
                RemoteError::session_closed(&self.host)
            } else {
                RemoteError::Network {
                    host: self.host.clone(),
                    reason: format!("Failed to open channel: {}", e),
                }
            }
        })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteError::Network {
                host: self.host.clone(),
                reason: format!("Failed to execute command: {}", e),
            })?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                // ext == 1 is stderr in SSH protocol
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Eof) => {
                    if exit_code.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        let _ = channel.close().await;

        if exit_code.is_none() && self.handle.is_closed() {
            return Err(RemoteError::session_closed(&self.host));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
        })
    }

    async fn probe(&mut self) -> Result<(), RemoteError> {
        let output = self.exec("echo 1").await?;
        if output.exit_code == 0 {
            Ok(())
        } else {
            Err(RemoteError::Network {
                host: self.host.clone(),
                reason: format!("probe exited with {}", output.exit_code),
            })
        }
    }

    async fn remote_size(&mut self, path: &str) -> Result<u64, RemoteError> {
        self.ensure_sftp().await?;
        let metadata = self
            .sftp()?
            .metadata(path)
            .await
            .map_err(|e| self.io_error(format!("stat {}: {}", path, e)))?;
        Ok(metadata.size.unwrap_or(0))
    }

    async fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, RemoteError> {
        self.ensure_sftp().await?;
        let mut file = self
            .sftp()?
            .open(path)
            .await
            .map_err(|e| self.io_error(format!("open {}: {}", path, e)))?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);

        let _ = file.shutdown().await;
        Ok(buffer)
    }

    async fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), RemoteError> {
        self.ensure_sftp().await?;

        let flags = if offset == 0 {
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
        } else {
            OpenFlags::WRITE
        };

        let mut file = self
            .sftp()?
            .open_with_flags(path, flags)
            .await
            .map_err(|e| self.io_error(format!("open {}: {}", path, e)))?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| self.io_error(e))?;
        }

        file.write_all(data).await.map_err(|e| self.io_error(e))?;
        file.shutdown().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&mut self) {
        self.sftp = None;
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed by operator", "en")
            .await
        {
            warn!("Error during disconnect from {}: {}", self.host, e);
        }
    }
}
