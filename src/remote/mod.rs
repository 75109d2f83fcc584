//! Remote connection and multi-host execution core.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Serializable records, session metadata and tool responses
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and transport error classification
//! - `transport`: `Connector`/`Transport` seam over the wire protocol
//! - `client`: SSH implementation of the transport seam
//! - `auth`: SSH authentication strategies
//! - `storage`: Connection store and credential store
//! - `operation`: Typed remote operations rendered as encoded PowerShell
//! - `session`: One authenticated connection to one host
//! - `manager`: Session registry and connection records
//! - `fanout`: One operation across many hosts
//! - `transfer`: Chunked file transfers with pause/resume/cancel
//! - `events`: Status notifications for observers
//! - `commands`: MCP tool implementations

pub(crate) mod auth;
pub(crate) mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod manager;
pub mod operation;
pub mod session;
pub mod storage;
#[cfg(test)]
pub(crate) mod testing;
pub mod transfer;
pub mod transport;
pub mod types;

pub use client::SshConnector;
pub use commands::{McpRemoteCommands, RemoteConsole};
pub use config::RemoteConfig;
pub use error::{ErrorKind, RemoteError};
pub use events::{EventBus, RemoteEvent};
pub use fanout::{FanOutExecutor, HostOutcome, HostResult, OperationRequest, OperationResult};
pub use manager::{AuthInput, ConnectionUpdate, HostFilter, NewConnection, RemoteManager};
pub use operation::OperationKind;
pub use session::RemoteSession;
pub use transfer::{
    FileTransferController, TransferDirection, TransferInfo, TransferRequest, TransferState,
};
