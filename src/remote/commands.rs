//! MCP tool surface for the remote console.
//!
//! - Connection records: `remote_add_connection`, `remote_update_connection`,
//!   `remote_remove_connection`, `remote_list_connections`
//! - Sessions: `remote_connect`, `remote_disconnect`, `remote_disconnect_all`,
//!   `remote_list_sessions`
//! - Fan-out: `remote_apply`
//! - Transfers: `remote_transfer_start`, `remote_transfer_pause`,
//!   `remote_transfer_resume`, `remote_transfer_cancel`,
//!   `remote_transfer_status`, `remote_transfer_list`
//!
//! Tools are thin: they translate arguments and map [`RemoteError`] to the
//! `"<kind>: <message>"` strings MCP clients see.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tracing::{info, warn};

use super::client::SshConnector;
use super::config::RemoteConfig;
use super::error::RemoteError;
use super::fanout::{FanOutExecutor, OperationRequest, OperationResult};
use super::manager::{AuthInput, ConnectionUpdate, HostFilter, NewConnection, RemoteManager};
use super::operation::OperationKind;
use super::storage::{ConnectionStore, KeyringCredentialStore};
use super::transfer::{FileTransferController, TransferDirection, TransferInfo, TransferRequest};
use super::types::{
    ConnectResponse, ConnectionListResponse, ConnectionResponse, DisconnectAllResponse,
    DisconnectResponse, SessionListResponse, TransferListResponse,
};

/// The explicitly constructed core: registry, fan-out and transfers.
pub struct RemoteConsole {
    manager: Arc<RemoteManager>,
    executor: FanOutExecutor,
    transfers: FileTransferController,
}

impl RemoteConsole {
    pub fn new(manager: Arc<RemoteManager>) -> Self {
        Self {
            executor: FanOutExecutor::new(manager.clone()),
            transfers: FileTransferController::new(manager.clone()),
            manager,
        }
    }

    /// Production wiring: SSH transport, OS keychain, file-backed store.
    pub async fn from_config(config: RemoteConfig) -> Result<Self, RemoteError> {
        let store = match &config.store_path {
            Some(path) => ConnectionStore::load(path).await?,
            None => {
                warn!("No configuration directory found; connections will not be saved");
                ConnectionStore::in_memory()
            }
        };
        let connector = Arc::new(SshConnector::new(config.compression));
        let credentials = Arc::new(KeyringCredentialStore::new());
        let manager = Arc::new(RemoteManager::new(config, connector, credentials, store));
        Ok(Self::new(manager))
    }

    pub fn manager(&self) -> &Arc<RemoteManager> {
        &self.manager
    }

    pub fn executor(&self) -> &FanOutExecutor {
        &self.executor
    }

    pub fn transfers(&self) -> &FileTransferController {
        &self.transfers
    }

    /// Parse tool arguments into an [`OperationRequest`].
    pub fn operation_request(
        operation: serde_json::Value,
        hosts: Option<Vec<String>>,
    ) -> Result<OperationRequest, RemoteError> {
        let operation = OperationKind::from_value(operation)?;
        let targets = match hosts {
            Some(hosts) => HostFilter::Hosts(hosts),
            None => HostFilter::All,
        };
        Ok(OperationRequest { operation, targets })
    }

    pub async fn shutdown(&self) {
        let names = self.manager.disconnect_all().await;
        info!("Shut down with {} open session(s)", names.len());
    }
}

/// Pick exactly one authentication method from tool arguments.
fn auth_from_args(
    password: Option<String>,
    key_path: Option<String>,
    key_passphrase: Option<String>,
    use_agent: Option<bool>,
) -> Result<Option<AuthInput>, RemoteError> {
    let use_agent = use_agent.unwrap_or(false);
    let chosen = [password.is_some(), key_path.is_some(), use_agent]
        .iter()
        .filter(|b| **b)
        .count();
    if chosen > 1 {
        return Err(RemoteError::InvalidRequest(
            "give only one of password, key_path or use_agent".to_string(),
        ));
    }
    if key_passphrase.is_some() && key_path.is_none() {
        return Err(RemoteError::InvalidRequest(
            "key_passphrase requires key_path".to_string(),
        ));
    }

    Ok(match (password, key_path) {
        (Some(password), _) => Some(AuthInput::Password(password)),
        (None, Some(path)) => Some(AuthInput::KeyFile {
            path: PathBuf::from(path),
            passphrase: key_passphrase,
        }),
        (None, None) if use_agent => Some(AuthInput::Agent),
        (None, None) => None,
    })
}

/// Per-host timeout override from tool arguments. Zero is rejected.
fn timeout_from_args(timeout_secs: Option<u64>) -> Result<Option<Duration>, RemoteError> {
    match timeout_secs {
        Some(0) => Err(RemoteError::InvalidRequest(
            "timeout_secs must be at least 1".to_string(),
        )),
        other => Ok(other.map(Duration::from_secs)),
    }
}

fn to_message(e: RemoteError) -> String {
    format!("{}: {}", e.kind(), e)
}

/// MCP remote console tools.
#[derive(Clone)]
pub struct McpRemoteCommands {
    console: Arc<RemoteConsole>,
}

impl McpRemoteCommands {
    pub fn new(console: Arc<RemoteConsole>) -> Self {
        Self { console }
    }
}

#[Tools]
impl McpRemoteCommands {
    /// Save a named Windows host. Passwords and key passphrases go to the OS
    /// credential store; the connection file only keeps a reference.
    #[allow(clippy::too_many_arguments)]
    async fn remote_add_connection(
        &self,
        /// Unique connection name (e.g., "build-01")
        name: String,
        /// Hostname or IP, optionally with port (e.g., "10.0.0.5:22")
        hostname: String,
        /// Account to log in as
        username: String,
        /// Password for password authentication
        password: Option<String>,
        /// Path to a private key file for key authentication
        key_path: Option<String>,
        /// Passphrase for the private key, if it is encrypted
        key_passphrase: Option<String>,
        /// Authenticate with identities from the running SSH agent
        use_agent: Option<bool>,
        /// Persist the connection across restarts (default: true)
        saved: Option<bool>,
    ) -> Result<StructuredContent<ConnectionResponse>, String> {
        let auth = auth_from_args(password, key_path, key_passphrase, use_agent)
            .map_err(to_message)?
            .ok_or_else(|| "invalid_request: one of password, key_path or use_agent is required".to_string())?;

        let record = self
            .console
            .manager()
            .add_connection(NewConnection {
                name,
                hostname,
                username,
                auth,
                saved: saved.unwrap_or(true),
            })
            .await
            .map_err(to_message)?;

        Ok(StructuredContent(ConnectionResponse {
            message: format!(
                "Added connection '{}' ({}@{}). Use remote_connect to open a session.",
                record.name, record.username, record.hostname
            ),
            connection: record,
        }))
    }

    /// Edit a saved host. Refused while the host has a live session.
    #[allow(clippy::too_many_arguments)]
    async fn remote_update_connection(
        &self,
        /// Connection name to edit
        name: String,
        /// New hostname or IP
        hostname: Option<String>,
        /// New account name
        username: Option<String>,
        /// New password (replaces the stored credential)
        password: Option<String>,
        /// New private key path (replaces the stored credential)
        key_path: Option<String>,
        /// Passphrase for the new private key
        key_passphrase: Option<String>,
        /// Switch to SSH agent authentication
        use_agent: Option<bool>,
        /// Whether the connection is persisted
        saved: Option<bool>,
    ) -> Result<StructuredContent<ConnectionResponse>, String> {
        let auth =
            auth_from_args(password, key_path, key_passphrase, use_agent).map_err(to_message)?;
        let record = self
            .console
            .manager()
            .update_connection(
                &name,
                ConnectionUpdate {
                    hostname,
                    username,
                    auth,
                    saved,
                },
            )
            .await
            .map_err(to_message)?;

        Ok(StructuredContent(ConnectionResponse {
            message: format!("Updated connection '{}'", record.name),
            connection: record,
        }))
    }

    /// Delete a saved host, disconnecting it first and removing its secrets.
    async fn remote_remove_connection(
        &self,
        /// Connection name to remove
        name: String,
    ) -> Result<StructuredContent<ConnectionResponse>, String> {
        let record = self
            .console
            .manager()
            .remove_connection(&name)
            .await
            .map_err(to_message)?;
        Ok(StructuredContent(ConnectionResponse {
            message: format!("Removed connection '{}'", record.name),
            connection: record,
        }))
    }

    /// List saved hosts in the order they were added.
    async fn remote_list_connections(&self) -> StructuredContent<ConnectionListResponse> {
        let connections = self.console.manager().list_connections().await;
        StructuredContent(ConnectionListResponse {
            count: connections.len(),
            connections,
        })
    }

    /// Open a session to a saved host. A live session is reused; a dead one is
    /// replaced.
    async fn remote_connect(
        &self,
        /// Connection name
        name: String,
    ) -> Result<StructuredContent<ConnectResponse>, String> {
        let outcome = self
            .console
            .manager()
            .connect(&name)
            .await
            .map_err(to_message)?;
        let record = outcome.session.record();
        let message = if outcome.reused {
            format!("Reused live session to {}@{}", record.username, record.hostname)
        } else {
            format!("Connected to {}@{}", record.username, record.hostname)
        };
        Ok(StructuredContent(ConnectResponse {
            name,
            message,
            reused: outcome.reused,
            retry_attempts: outcome.session.retry_attempts(),
        }))
    }

    /// Close one session. Always succeeds; reports whether a session existed.
    async fn remote_disconnect(
        &self,
        /// Connection name
        name: String,
    ) -> StructuredContent<DisconnectResponse> {
        let disconnected = self.console.manager().disconnect(&name).await;
        StructuredContent(DisconnectResponse { name, disconnected })
    }

    /// Close every session.
    async fn remote_disconnect_all(&self) -> StructuredContent<DisconnectAllResponse> {
        let disconnected = self.console.manager().disconnect_all().await;
        StructuredContent(DisconnectAllResponse {
            count: disconnected.len(),
            disconnected,
        })
    }

    /// List sessions with their state, activity and last error.
    async fn remote_list_sessions(
        &self,
        /// Probe idle sessions and drop dead ones first (default: false)
        prune: Option<bool>,
    ) -> StructuredContent<SessionListResponse> {
        if prune.unwrap_or(false) {
            let pruned = self.console.manager().prune_dead().await;
            if !pruned.is_empty() {
                info!("Pruned dead sessions: {:?}", pruned);
            }
        }
        let sessions = self.console.manager().list_sessions();
        StructuredContent(SessionListResponse {
            count: sessions.len(),
            sessions,
        })
    }

    /// Apply one operation to several hosts and report per-host results.
    ///
    /// `operation` is JSON such as
    /// `{"kind": "set_environment_variable", "name": "VAR", "value": "1", "scope": "machine"}`.
    /// Kinds: set_environment_variable, delete_environment_variable,
    /// list_environment_variables, set_registry_value, delete_registry_value,
    /// control_service, stop_process.
    async fn remote_apply(
        &self,
        /// Operation JSON object with a "kind" field and its parameters
        operation: serde_json::Value,
        /// Target connection names in result order (default: every connected host)
        hosts: Option<Vec<String>>,
        /// Per-host timeout in seconds (default: 60, env: WINADMIN_OPERATION_TIMEOUT)
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<OperationResult>, String> {
        let request = RemoteConsole::operation_request(operation, hosts).map_err(to_message)?;
        let executor = match timeout_from_args(timeout_secs).map_err(to_message)? {
            Some(bound) => self.console.executor().clone().with_operation_timeout(bound),
            None => self.console.executor().clone(),
        };
        let result = executor.execute(&request).await.map_err(to_message)?;
        Ok(StructuredContent(result))
    }

    /// Start a chunked upload or download on a connected host.
    async fn remote_transfer_start(
        &self,
        /// Connection name
        host: String,
        /// "upload" or "download"
        direction: TransferDirection,
        /// Local file path
        local_path: String,
        /// Remote file path (e.g., "C:/Deploy/setup.msi")
        remote_path: String,
    ) -> Result<StructuredContent<TransferInfo>, String> {
        let info = self
            .console
            .transfers()
            .submit(TransferRequest {
                host,
                direction,
                local_path: PathBuf::from(local_path),
                remote_path,
            })
            .await
            .map_err(to_message)?;
        Ok(StructuredContent(info))
    }

    /// Pause a transfer at its next chunk boundary.
    async fn remote_transfer_pause(
        &self,
        /// Transfer ID
        transfer_id: String,
    ) -> Result<StructuredContent<TransferInfo>, String> {
        self.console
            .transfers()
            .pause(&transfer_id)
            .map(StructuredContent)
            .map_err(to_message)
    }

    /// Resume a paused transfer from its recorded offset.
    async fn remote_transfer_resume(
        &self,
        /// Transfer ID
        transfer_id: String,
    ) -> Result<StructuredContent<TransferInfo>, String> {
        self.console
            .transfers()
            .resume(&transfer_id)
            .map(StructuredContent)
            .map_err(to_message)
    }

    /// Cancel a transfer at its next chunk boundary.
    async fn remote_transfer_cancel(
        &self,
        /// Transfer ID
        transfer_id: String,
    ) -> Result<Text<String>, String> {
        let info = self
            .console
            .transfers()
            .cancel(&transfer_id)
            .map_err(to_message)?;
        Ok(Text(format!(
            "Cancellation requested for transfer {} at {}/{} bytes",
            info.id, info.transferred_bytes, info.total_bytes
        )))
    }

    /// Get a transfer's progress, optionally waiting until it finishes.
    async fn remote_transfer_status(
        &self,
        /// Transfer ID
        transfer_id: String,
        /// Block until the transfer is complete, failed or cancelled (default: false)
        wait: Option<bool>,
    ) -> Result<StructuredContent<TransferInfo>, String> {
        let transfers = self.console.transfers();
        if wait.unwrap_or(false) {
            return transfers
                .wait(&transfer_id)
                .await
                .map(StructuredContent)
                .map_err(to_message);
        }
        transfers
            .snapshot(&transfer_id)
            .map(StructuredContent)
            .ok_or_else(|| format!("invalid_request: no transfer with id '{}'", transfer_id))
    }

    /// List transfers, oldest first.
    async fn remote_transfer_list(
        &self,
        /// Forget finished transfers after listing them (default: false)
        clear_finished: Option<bool>,
    ) -> StructuredContent<TransferListResponse> {
        let transfers = self.console.transfers().list();
        let cleared = if clear_finished.unwrap_or(false) {
            self.console.transfers().clear_finished()
        } else {
            0
        };
        StructuredContent(TransferListResponse {
            count: transfers.len(),
            transfers,
            cleared,
        })
    }
}
