//! One authenticated connection to one host.
//!
//! A [`RemoteSession`] is the only path through which a host is touched. It
//! owns the transport behind a `tokio::sync::Mutex`, so command execution and
//! transfer chunks against the same host are serialized.
//!
//! # Lifecycle
//!
//! ```text
//! disconnected -> connecting -> connected -> { disconnected, error }
//! ```
//!
//! `error` is terminal for the instance; the manager replaces the session on
//! the next connect. Teardown cancels the session's [`CancellationToken`]:
//! calls racing it fail with `SessionClosed` instead of hanging, and transfer
//! drivers bound to the session stop at their next chunk boundary.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{MAX_RETRY_DELAY, RemoteConfig};
use super::error::RemoteError;
use super::events::{EventBus, RemoteEvent};
use super::operation::{OperationKind, OperationOutcome, interpret_output};
use super::transfer::TransferDirection;
use super::transport::{Connector, Credential, ExecOutput, Transport};
use super::types::{ConnectionRecord, SessionInfo, SessionState};

/// One bounded piece of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRequest<'a> {
    pub direction: TransferDirection,
    pub local_path: &'a Path,
    pub remote_path: &'a str,
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

pub struct RemoteSession {
    record: ConnectionRecord,
    transport: Mutex<Option<Box<dyn Transport>>>,
    status: RwLock<Status>,
    connected_at: DateTime<Utc>,
    last_activity: SyncMutex<Activity>,
    retry_attempts: u32,
    closed: CancellationToken,
    liveness_idle: Duration,
    probe_timeout: Duration,
    events: EventBus,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("name", &self.record.name)
            .field("state", &self.state())
            .finish()
    }
}

impl RemoteSession {
    /// Establish, authenticate and probe a session.
    ///
    /// Transient network failures and timeouts are retried with exponential
    /// backoff; authentication failures are not. On failure nothing stays
    /// open.
    pub async fn connect(
        connector: &dyn Connector,
        record: ConnectionRecord,
        credential: Credential,
        config: &RemoteConfig,
        events: EventBus,
    ) -> Result<Self, RemoteError> {
        events.emit(RemoteEvent::SessionState {
            name: record.name.clone(),
            state: SessionState::Connecting,
            error: None,
        });
        info!(
            "Connecting to {} ({}@{}) with timeout {:?}, max_retries={}",
            record.name, record.username, record.hostname, config.connect_timeout, config.max_retries
        );

        let backoff = ExponentialBuilder::default()
            .with_min_delay(config.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(config.max_retries as usize)
            .with_jitter();

        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let bound = config.connect_timeout;
        let record_ref = &record;
        let credential_ref = &credential;

        let result = (move || {
            let credential = credential_ref.clone();
            async move {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                open_once(connector, record_ref, credential, bound).await
            }
        })
        .retry(backoff)
        .when(|e: &RemoteError| {
            let retryable = e.is_retryable_connect();
            if !retryable {
                warn!("Not retrying connection to {}: {}", record_ref.name, e);
            }
            retryable
        })
        .notify(|e: &RemoteError, dur: Duration| {
            warn!("Connection to {} failed: {}. Retrying in {:?}", record_ref.name, e, dur);
        })
        .await;

        let retry_attempts = attempts.load(Ordering::SeqCst).saturating_sub(1);

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Connection to {} failed after {} attempt(s): {}", record.name, retry_attempts + 1, e);
                events.emit(RemoteEvent::SessionState {
                    name: record.name.clone(),
                    state: SessionState::Error,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        info!("Connected to {} after {} retries", record.name, retry_attempts);
        events.emit(RemoteEvent::SessionState {
            name: record.name.clone(),
            state: SessionState::Connected,
            error: None,
        });

        let now = Activity::now();
        Ok(Self {
            record,
            transport: Mutex::new(Some(transport)),
            status: RwLock::new(Status {
                state: SessionState::Connected,
                last_error: None,
            }),
            connected_at: now.wall,
            last_activity: SyncMutex::new(now),
            retry_attempts,
            closed: CancellationToken::new(),
            liveness_idle: config.liveness_idle,
            probe_timeout: config.connect_timeout,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    pub fn state(&self) -> SessionState {
        self.status.read().state
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Token cancelled when the session is torn down.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn info(&self) -> SessionInfo {
        let status = self.status.read();
        SessionInfo {
            name: self.record.name.clone(),
            hostname: self.record.hostname.clone(),
            username: self.record.username.clone(),
            state: status.state,
            connected_at: self.connected_at.to_rfc3339(),
            last_activity: self.last_activity.lock().wall.to_rfc3339(),
            retry_attempts: self.retry_attempts,
            last_error: status.last_error.clone(),
        }
    }

    /// Cheap liveness check: connected, not torn down, transport still open.
    ///
    /// A transport busy with another call counts as alive.
    pub fn is_alive(&self) -> bool {
        if self.state() != SessionState::Connected || self.closed.is_cancelled() {
            return false;
        }
        match self.transport.try_lock() {
            Ok(guard) => guard.as_ref().is_some_and(|t| !t.is_closed()),
            Err(_) => true,
        }
    }

    /// [`is_alive`](Self::is_alive), confirmed with a probe when the session
    /// has been idle longer than the liveness threshold.
    ///
    /// A transport held by an in-flight call is alive. Only a probe failing
    /// with `Network` or `SessionClosed` marks the session dead; a slow probe
    /// does not.
    pub async fn check_alive(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.last_activity.lock().at.elapsed() < self.liveness_idle {
            return true;
        }
        let Ok(mut guard) = self.transport.try_lock() else {
            return true;
        };

        debug!("Probing idle session {}", self.record.name);
        let host = self.name();
        let probed = self
            .race("probe", self.probe_timeout, async move {
                let transport = guard.as_mut().ok_or_else(|| RemoteError::session_closed(host))?;
                transport.probe().await
            })
            .await;
        match probed {
            Ok(()) => true,
            Err(RemoteError::SessionClosed { .. } | RemoteError::Network { .. }) => false,
            Err(e) => {
                debug!("Inconclusive probe of {}: {}", host, e);
                true
            }
        }
    }

    /// Run one operation and interpret the remote response.
    pub async fn execute(
        &self,
        operation: &OperationKind,
        bound: Duration,
    ) -> Result<OperationOutcome, RemoteError> {
        let command = operation.command_line()?;
        debug!("{}: {}", self.record.name, operation.label());
        let output = self.exec(&command, bound).await?;
        interpret_output(&self.record.name, output)
    }

    /// Run a raw command line.
    pub async fn exec(&self, command: &str, bound: Duration) -> Result<ExecOutput, RemoteError> {
        let host = self.name();
        self.race("execute", bound, async {
            let mut guard = self.transport.lock().await;
            let transport = guard.as_mut().ok_or_else(|| RemoteError::session_closed(host))?;
            transport.exec(command).await
        })
        .await
    }

    /// Size of a remote file.
    pub async fn remote_size(&self, path: &str, bound: Duration) -> Result<u64, RemoteError> {
        let host = self.name();
        self.race("stat", bound, async {
            let mut guard = self.transport.lock().await;
            let transport = guard.as_mut().ok_or_else(|| RemoteError::session_closed(host))?;
            transport.remote_size(path).await
        })
        .await
    }

    /// Move one chunk. Returns the bytes moved; 0 means end of the source.
    pub async fn transfer_chunk(
        &self,
        chunk: &ChunkRequest<'_>,
        bound: Duration,
    ) -> Result<usize, RemoteError> {
        let host = self.name();
        self.race("transfer", bound, async {
            match chunk.direction {
                TransferDirection::Upload => {
                    let data = read_local(chunk.local_path, chunk.offset, chunk.len)
                        .await
                        .map_err(|e| RemoteError::io(host, format!("{}: {}", chunk.local_path.display(), e)))?;
                    let mut guard = self.transport.lock().await;
                    let transport =
                        guard.as_mut().ok_or_else(|| RemoteError::session_closed(host))?;
                    transport.write_at(chunk.remote_path, chunk.offset, &data).await?;
                    Ok(data.len())
                }
                TransferDirection::Download => {
                    let data = {
                        let mut guard = self.transport.lock().await;
                        let transport =
                            guard.as_mut().ok_or_else(|| RemoteError::session_closed(host))?;
                        transport.read_at(chunk.remote_path, chunk.offset, chunk.len).await?
                    };
                    write_local(chunk.local_path, chunk.offset, &data)
                        .await
                        .map_err(|e| RemoteError::io(host, format!("{}: {}", chunk.local_path.display(), e)))?;
                    Ok(data.len())
                }
            }
        })
        .await
    }

    /// Tear the session down. Idempotent.
    ///
    /// Returns whether the session was still live.
    pub async fn disconnect(&self) -> bool {
        // State first: observers woken by the token read it.
        let changed = {
            let mut status = self.status.write();
            if status.state == SessionState::Connected {
                status.state = SessionState::Disconnected;
                true
            } else {
                false
            }
        };
        let was_live = !self.closed.is_cancelled();
        self.closed.cancel();

        let transport = self.transport.lock().await.take();
        if let Some(mut transport) = transport {
            transport.close().await;
        }

        if changed {
            info!("Disconnected {}", self.record.name);
            self.events.emit(RemoteEvent::SessionState {
                name: self.record.name.clone(),
                state: SessionState::Disconnected,
                error: None,
            });
        }
        was_live
    }

    /// Race `work` against teardown and `bound`, then book-keep the outcome.
    async fn race<T>(
        &self,
        operation: &str,
        bound: Duration,
        work: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let host = self.name();
        if self.closed.is_cancelled() || self.state() != SessionState::Connected {
            return Err(RemoteError::session_closed(host));
        }
        *self.last_activity.lock() = Activity::now();

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RemoteError::session_closed(host)),
            outcome = tokio::time::timeout(bound, work) => {
                outcome.unwrap_or_else(|_| Err(RemoteError::timeout(host, operation, bound)))
            }
        };

        match &result {
            Ok(_) => *self.last_activity.lock() = Activity::now(),
            Err(e @ (RemoteError::SessionClosed { .. } | RemoteError::Network { .. })) => {
                if !self.closed.is_cancelled() {
                    self.fail(e).await;
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Transport failure: move to `error` and release everything.
    async fn fail(&self, error: &RemoteError) {
        {
            let mut status = self.status.write();
            if status.state != SessionState::Connected {
                return;
            }
            warn!("Session {} failed: {}", self.record.name, error);
            status.state = SessionState::Error;
            status.last_error = Some(error.to_string());
        }
        self.closed.cancel();

        let transport = self.transport.lock().await.take();
        if let Some(mut transport) = transport {
            transport.close().await;
        }

        self.events.emit(RemoteEvent::SessionState {
            name: self.record.name.clone(),
            state: SessionState::Error,
            error: Some(error.to_string()),
        });
    }
}

async fn open_once(
    connector: &dyn Connector,
    record: &ConnectionRecord,
    credential: Credential,
    bound: Duration,
) -> Result<Box<dyn Transport>, RemoteError> {
    let handshake = async {
        let mut transport = connector.open(record, credential, bound).await?;
        if let Err(e) = transport.probe().await {
            transport.close().await;
            return Err(e);
        }
        Ok(transport)
    };

    tokio::time::timeout(bound, handshake)
        .await
        .map_err(|_| RemoteError::timeout(&record.name, "connect", bound))?
}

async fn read_local(path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Offset 0 creates or truncates the local file.
async fn write_local(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = if offset == 0 {
        fs::File::create(path).await?
    } else {
        fs::OpenOptions::new().write(true).open(path).await?
    };
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}
