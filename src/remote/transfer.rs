//! Chunked file transfers with pause, resume and cancel.
//!
//! Every transfer gets its own driver task bound to one session. The driver
//! moves one chunk at a time and checks its control channel between chunks,
//! so pause and cancel take effect at the next chunk boundary and a paused
//! transfer resumes at exactly the recorded offset.
//!
//! ```text
//! pending -> active -> { paused, complete, failed, cancelled }
//! paused  -> active | cancelled
//! ```
//!
//! Failure policy: an I/O error is retried a bounded number of times with
//! backoff; a closed session fails the transfer at once. When the session is
//! disconnected on purpose, its transfers end as cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::MAX_RETRY_DELAY;
use super::error::{ErrorKind, RemoteError};
use super::events::{EventBus, RemoteEvent};
use super::manager::RemoteManager;
use super::session::{ChunkRequest, RemoteSession};
use super::types::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Active,
    Paused,
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Failed | TransferState::Cancelled
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransferState::Pending => "pending",
            TransferState::Active => "active",
            TransferState::Paused => "paused",
            TransferState::Complete => "complete",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub host: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// Snapshot of one transfer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransferInfo {
    pub id: String,
    pub host: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub total_bytes: u64,
    /// Bytes moved by completed chunks
    pub transferred_bytes: u64,
    pub state: TransferState,
    pub chunks: u64,
    /// Chunk retries spent on transient errors
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// RFC3339 format
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Created, waiting for `start`
    Hold,
    Run,
    Pause,
    Cancel,
}

struct TransferEntry {
    seq: u64,
    info: watch::Sender<TransferInfo>,
    control: watch::Sender<Control>,
}

impl TransferEntry {
    fn snapshot(&self) -> TransferInfo {
        self.info.borrow().clone()
    }

    fn state(&self) -> TransferState {
        self.info.borrow().state
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    chunk_size: usize,
    chunk_retries: u32,
    retry_delay: Duration,
    chunk_timeout: Duration,
}

pub struct FileTransferController {
    manager: Arc<RemoteManager>,
    tasks: DashMap<String, Arc<TransferEntry>>,
    next_seq: AtomicU64,
    settings: Settings,
}

impl FileTransferController {
    pub fn new(manager: Arc<RemoteManager>) -> Self {
        let config = manager.config();
        let settings = Settings {
            chunk_size: config.chunk_size.max(1),
            chunk_retries: config.chunk_retries,
            retry_delay: config.retry_delay,
            chunk_timeout: config.operation_timeout,
        };
        Self {
            manager,
            tasks: DashMap::new(),
            next_seq: AtomicU64::new(0),
            settings,
        }
    }

    /// Register a transfer against a connected session. It stays `pending`
    /// until [`start`](Self::start).
    pub async fn create(&self, request: TransferRequest) -> Result<TransferInfo, RemoteError> {
        if request.remote_path.trim().is_empty() {
            return Err(RemoteError::InvalidRequest(
                "remote path must not be empty".to_string(),
            ));
        }
        let session = self.manager.connected_session(&request.host)?;

        let total_bytes = match request.direction {
            TransferDirection::Upload => {
                let metadata = tokio::fs::metadata(&request.local_path).await.map_err(|e| {
                    RemoteError::io(&request.host, format!("{}: {}", request.local_path.display(), e))
                })?;
                if !metadata.is_file() {
                    return Err(RemoteError::InvalidRequest(format!(
                        "{} is not a file",
                        request.local_path.display()
                    )));
                }
                metadata.len()
            }
            TransferDirection::Download => {
                session
                    .remote_size(&request.remote_path, self.settings.chunk_timeout)
                    .await?
            }
        };

        let now = chrono::Utc::now().to_rfc3339();
        let info = TransferInfo {
            id: Uuid::new_v4().to_string(),
            host: request.host.clone(),
            direction: request.direction,
            local_path: request.local_path.display().to_string(),
            remote_path: request.remote_path.clone(),
            total_bytes,
            transferred_bytes: 0,
            state: TransferState::Pending,
            chunks: 0,
            retries: 0,
            error_kind: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        };

        let (info_tx, _) = watch::channel(info.clone());
        let (control_tx, control_rx) = watch::channel(Control::Hold);
        let entry = Arc::new(TransferEntry {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            info: info_tx,
            control: control_tx,
        });
        self.tasks.insert(info.id.clone(), entry.clone());

        info!(
            "Transfer {} created: {:?} {} <-> {}:{} ({} bytes)",
            info.id, info.direction, info.local_path, info.host, info.remote_path, total_bytes
        );
        let events = self.manager.events().clone();
        events.emit(RemoteEvent::TransferState {
            id: info.id.clone(),
            host: info.host.clone(),
            state: TransferState::Pending,
            error: None,
        });

        let driver = Driver {
            entry,
            session,
            request,
            settings: self.settings,
            events,
        };
        tokio::spawn(driver.run(control_rx));

        Ok(info)
    }

    /// Create and start in one step.
    pub async fn submit(&self, request: TransferRequest) -> Result<TransferInfo, RemoteError> {
        let info = self.create(request).await?;
        self.start(&info.id)
    }

    pub fn start(&self, id: &str) -> Result<TransferInfo, RemoteError> {
        let entry = self.entry(id)?;
        let control = *entry.control.borrow();
        match (entry.state(), control) {
            (TransferState::Pending, Control::Hold) => {
                entry.control.send_replace(Control::Run);
            }
            (TransferState::Pending | TransferState::Active, Control::Run) => {}
            (state, _) => return Err(invalid_transition(id, state, "start")),
        }
        Ok(entry.snapshot())
    }

    /// Park the transfer at the next chunk boundary, keeping its offset.
    pub fn pause(&self, id: &str) -> Result<TransferInfo, RemoteError> {
        let entry = self.entry(id)?;
        let control = *entry.control.borrow();
        match (entry.state(), control) {
            (state, _) if state.is_terminal() => return Err(invalid_transition(id, state, "pause")),
            (_, Control::Pause) => {}
            (_, Control::Run) => {
                entry.control.send_replace(Control::Pause);
            }
            (state, _) => return Err(invalid_transition(id, state, "pause")),
        }
        Ok(entry.snapshot())
    }

    pub fn resume(&self, id: &str) -> Result<TransferInfo, RemoteError> {
        let entry = self.entry(id)?;
        let control = *entry.control.borrow();
        match (entry.state(), control) {
            (state, _) if state.is_terminal() => return Err(invalid_transition(id, state, "resume")),
            (_, Control::Pause) => {
                entry.control.send_replace(Control::Run);
            }
            (_, Control::Run) => {}
            (state, _) => return Err(invalid_transition(id, state, "resume")),
        }
        Ok(entry.snapshot())
    }

    /// Stop the transfer at the next chunk boundary.
    pub fn cancel(&self, id: &str) -> Result<TransferInfo, RemoteError> {
        let entry = self.entry(id)?;
        let state = entry.state();
        if state.is_terminal() {
            return Err(invalid_transition(id, state, "cancel"));
        }
        entry.control.send_replace(Control::Cancel);
        Ok(entry.snapshot())
    }

    pub fn snapshot(&self, id: &str) -> Option<TransferInfo> {
        self.tasks.get(id).map(|e| e.snapshot())
    }

    /// All known transfers, oldest first.
    pub fn list(&self) -> Vec<TransferInfo> {
        let mut entries: Vec<Arc<TransferEntry>> =
            self.tasks.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Watch one transfer's snapshots.
    pub fn subscribe_task(&self, id: &str) -> Option<watch::Receiver<TransferInfo>> {
        self.tasks.get(id).map(|e| e.info.subscribe())
    }

    /// Resolve once the transfer reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<TransferInfo, RemoteError> {
        let mut rx = self.entry(id)?.info.subscribe();
        let info = rx
            .wait_for(|i| i.state.is_terminal())
            .await
            .map_err(|_| RemoteError::InvalidRequest(format!("transfer '{}' was dropped", id)))?
            .clone();
        Ok(info)
    }

    /// Forget finished transfers. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, e| !e.state().is_terminal());
        before - self.tasks.len()
    }

    fn entry(&self, id: &str) -> Result<Arc<TransferEntry>, RemoteError> {
        self.tasks
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RemoteError::InvalidRequest(format!("no transfer with id '{}'", id)))
    }
}

fn invalid_transition(id: &str, state: TransferState, action: &str) -> RemoteError {
    RemoteError::InvalidRequest(format!("cannot {} transfer '{}' while it is {}", action, id, state))
}

/// Moves one transfer's chunks.
struct Driver {
    entry: Arc<TransferEntry>,
    session: Arc<RemoteSession>,
    request: TransferRequest,
    settings: Settings,
    events: EventBus,
}

impl Driver {
    async fn run(self, mut control: watch::Receiver<Control>) {
        let closed = self.session.closed_token();
        let mut started = false;

        loop {
            let command = *control.borrow_and_update();
            match command {
                Control::Cancel => return self.finish(TransferState::Cancelled, None),
                Control::Hold | Control::Pause => {
                    if command == Control::Pause {
                        self.set_state(TransferState::Paused);
                    }
                    tokio::select! {
                        changed = control.changed() => {
                            if changed.is_err() {
                                return self.finish(TransferState::Cancelled, None);
                            }
                        }
                        _ = closed.cancelled() => return self.session_gone(),
                    }
                    continue;
                }
                Control::Run => {}
            }

            if closed.is_cancelled() {
                return self.session_gone();
            }
            self.set_state(TransferState::Active);

            let (offset, total) = {
                let info = self.entry.info.borrow();
                (info.transferred_bytes, info.total_bytes)
            };
            if started && offset >= total {
                return self.finish(TransferState::Complete, None);
            }

            let len = total.saturating_sub(offset).min(self.settings.chunk_size as u64) as usize;
            let chunk = ChunkRequest {
                direction: self.request.direction,
                local_path: &self.request.local_path,
                remote_path: &self.request.remote_path,
                offset,
                len,
            };

            match self.move_chunk(&chunk).await {
                Ok(0) if offset < total => {
                    let error = RemoteError::io(
                        &self.request.host,
                        format!("source ended at byte {} of {}", offset, total),
                    );
                    return self.finish(TransferState::Failed, Some(&error));
                }
                Ok(n) => {
                    started = true;
                    self.advance(n as u64);
                }
                Err(RemoteError::SessionClosed { .. }) => return self.session_gone(),
                Err(e) => return self.finish(TransferState::Failed, Some(&e)),
            }
        }
    }

    /// One chunk, retrying transient I/O errors.
    async fn move_chunk(&self, chunk: &ChunkRequest<'_>) -> Result<usize, RemoteError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.settings.chunk_retries as usize)
            .with_jitter();

        let session: &RemoteSession = &self.session;
        let bound = self.settings.chunk_timeout;

        (move || session.transfer_chunk(chunk, bound))
            .retry(backoff)
            .when(|e: &RemoteError| e.is_retryable_chunk())
            .notify(|e: &RemoteError, dur: Duration| {
                self.entry.info.send_modify(|i| i.retries += 1);
                warn!(
                    "Transfer {} chunk at {} failed: {}. Retrying in {:?}",
                    self.id(),
                    chunk.offset,
                    e,
                    dur
                );
            })
            .await
    }

    fn id(&self) -> String {
        self.entry.info.borrow().id.clone()
    }

    fn advance(&self, n: u64) {
        let mut progress = (0, 0);
        self.entry.info.send_modify(|i| {
            i.transferred_bytes += n;
            i.chunks += 1;
            i.updated_at = chrono::Utc::now().to_rfc3339();
            progress = (i.transferred_bytes, i.total_bytes);
        });
        debug!("Transfer {}: {}/{} bytes", self.id(), progress.0, progress.1);
        self.events.emit(RemoteEvent::TransferProgress {
            id: self.id(),
            host: self.request.host.clone(),
            transferred: progress.0,
            total: progress.1,
        });
    }

    fn set_state(&self, state: TransferState) {
        let changed = self.entry.info.send_if_modified(|i| {
            if i.state == state {
                return false;
            }
            i.state = state;
            i.updated_at = chrono::Utc::now().to_rfc3339();
            true
        });
        if changed {
            self.events.emit(RemoteEvent::TransferState {
                id: self.id(),
                host: self.request.host.clone(),
                state,
                error: None,
            });
        }
    }

    /// The bound session went away: cancelled if it was disconnected on
    /// purpose, failed otherwise.
    fn session_gone(&self) {
        if self.session.state() == SessionState::Disconnected {
            let error = RemoteError::Cancelled {
                host: self.request.host.clone(),
            };
            self.finish(TransferState::Cancelled, Some(&error));
        } else {
            let error = RemoteError::session_closed(&self.request.host);
            self.finish(TransferState::Failed, Some(&error));
        }
    }

    fn finish(&self, state: TransferState, error: Option<&RemoteError>) {
        self.entry.info.send_modify(|i| {
            i.state = state;
            i.error_kind = error.map(RemoteError::kind);
            i.last_error = error.map(ToString::to_string);
            i.updated_at = chrono::Utc::now().to_rfc3339();
        });

        let info = self.entry.snapshot();
        match state {
            TransferState::Failed => warn!(
                "Transfer {} failed at {}/{} bytes: {}",
                info.id,
                info.transferred_bytes,
                info.total_bytes,
                info.last_error.as_deref().unwrap_or("unknown error")
            ),
            _ => info!(
                "Transfer {} {} at {}/{} bytes",
                info.id, state, info.transferred_bytes, info.total_bytes
            ),
        }

        self.events.emit(RemoteEvent::TransferState {
            id: info.id,
            host: info.host,
            state,
            error: info.last_error,
        });
    }
}
