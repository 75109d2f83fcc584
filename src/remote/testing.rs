//! In-memory transport for tests.
//!
//! A [`FakeConnector`] knows a set of scripted [`FakeHost`]s keyed by
//! hostname. Each host checks a password, can fail its first connects, keeps
//! remote files in memory, records the commands it ran and injects chunk
//! faults on request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::config::RemoteConfig;
use super::error::RemoteError;
use super::transport::{Connector, Credential, ExecOutput, Transport};
use super::types::ConnectionRecord;

/// Settings tuned for fast tests.
pub fn test_config() -> RemoteConfig {
    RemoteConfig {
        connect_timeout: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(2),
        max_retries: 2,
        retry_delay: Duration::from_millis(5),
        compression: false,
        pool_size: 4,
        chunk_size: 4,
        chunk_retries: 3,
        liveness_idle: Duration::from_secs(30),
        store_path: None,
    }
}

/// One scripted remote machine.
pub struct FakeHost {
    password: String,
    transient_failures: AtomicU32,
    opens: AtomicU32,
    live: AtomicU32,
    killed: AtomicBool,
    exec_latency: Mutex<Duration>,
    exec_reply: Mutex<ExecOutput>,
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    chunk_latency: Mutex<Duration>,
    chunk_calls: AtomicU32,
    io_faults: AtomicU32,
    drop_after_chunks: Mutex<Option<u32>>,
}

impl FakeHost {
    fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            transient_failures: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            live: AtomicU32::new(0),
            killed: AtomicBool::new(false),
            exec_latency: Mutex::new(Duration::ZERO),
            exec_reply: Mutex::new(ExecOutput::default()),
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            chunk_latency: Mutex::new(Duration::ZERO),
            chunk_calls: AtomicU32::new(0),
            io_faults: AtomicU32::new(0),
            drop_after_chunks: Mutex::new(None),
        }
    }

    /// Refuse the next `n` connects with a transient network error.
    pub fn fail_next_connects(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_exec_latency(&self, latency: Duration) {
        *self.exec_latency.lock() = latency;
    }

    pub fn set_exec_reply(&self, reply: ExecOutput) {
        *self.exec_reply.lock() = reply;
    }

    pub fn set_chunk_latency(&self, latency: Duration) {
        *self.chunk_latency.lock() = latency;
    }

    /// Fail the next `n` chunk calls with an I/O error.
    pub fn inject_io_faults(&self, n: u32) {
        self.io_faults.store(n, Ordering::SeqCst);
    }

    /// Drop the connection once `n` chunk calls have completed.
    pub fn drop_after_chunks(&self, n: u32) {
        *self.drop_after_chunks.lock() = Some(n);
    }

    /// Simulate the network path dying under every open transport.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.files.lock().insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Successful opens so far.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Transports currently open.
    pub fn live_transports(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn chunk_calls(&self) -> u32 {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Shared prologue of every chunk call.
    async fn chunk_gate(&self, host: &str) -> Result<(), RemoteError> {
        if self.is_killed() {
            return Err(RemoteError::session_closed(host));
        }
        let latency = *self.chunk_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let calls = self.chunk_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = *self.drop_after_chunks.lock() {
            if calls > limit {
                self.kill();
                return Err(RemoteError::session_closed(host));
            }
        }
        let faulted = self
            .io_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(RemoteError::io(host, "injected fault"));
        }
        Ok(())
    }
}

/// Connector resolving hostnames to [`FakeHost`]s.
#[derive(Default)]
pub struct FakeConnector {
    hosts: DashMap<String, Arc<FakeHost>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, hostname: &str, password: &str) -> Arc<FakeHost> {
        let host = Arc::new(FakeHost::new(password));
        self.hosts.insert(hostname.to_string(), host.clone());
        host
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        record: &ConnectionRecord,
        credential: Credential,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, RemoteError> {
        let Some(host) = self.hosts.get(&record.hostname).map(|h| h.clone()) else {
            return Err(RemoteError::Network {
                host: record.name.clone(),
                reason: "Name or service not known".to_string(),
            });
        };

        let transient = host
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(RemoteError::Network {
                host: record.name.clone(),
                reason: "Connection refused".to_string(),
            });
        }

        match credential {
            Credential::Password(ref p) if *p == host.password => {}
            _ => {
                return Err(RemoteError::Auth {
                    host: record.name.clone(),
                    reason: "Password authentication failed".to_string(),
                });
            }
        }

        host.opens.fetch_add(1, Ordering::SeqCst);
        host.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            name: record.name.clone(),
            host,
            closed: false,
        }))
    }
}

pub struct FakeTransport {
    name: String,
    host: Arc<FakeHost>,
    closed: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::session_closed(&self.name));
        }
        self.host.commands.lock().push(command.to_string());
        let latency = *self.host.exec_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(self.host.exec_reply.lock().clone())
    }

    async fn probe(&mut self) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::Network {
                host: self.name.clone(),
                reason: "Connection reset by peer".to_string(),
            });
        }
        Ok(())
    }

    async fn remote_size(&mut self, path: &str) -> Result<u64, RemoteError> {
        self.host
            .file(path)
            .map(|f| f.len() as u64)
            .ok_or_else(|| RemoteError::io(&self.name, format!("{}: no such file", path)))
    }

    async fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, RemoteError> {
        self.host.chunk_gate(&self.name).await?;
        let files = self.host.files.lock();
        let data = files
            .get(path)
            .ok_or_else(|| RemoteError::io(&self.name, format!("{}: no such file", path)))?;
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), RemoteError> {
        self.host.chunk_gate(&self.name).await?;
        let mut files = self.host.files.lock();
        let file = files.entry(path.to_string()).or_default();
        let offset = offset as usize;
        if offset == 0 {
            file.clear();
        }
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed || self.host.is_killed()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.host.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
