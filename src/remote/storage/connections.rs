//! Connection record store.
//!
//! Records are kept in insertion order and persisted as
//! `{"version": 1, "connections": [...]}`. Only records with `saved = true`
//! are written. Secrets never reach this file: records carry a
//! [`CredentialRef`](crate::remote::types::CredentialRef) instead.
//!
//! Writes go to a temp file that is renamed over the target. A corrupted file
//! is moved aside to `*.corrupt` and an empty store is used.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::remote::error::RemoteError;
use crate::remote::types::ConnectionRecord;

/// Current on-disk format version
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    connections: Vec<ConnectionRecord>,
}

/// Named remote targets, optionally backed by a file.
#[derive(Debug, Default)]
pub struct ConnectionStore {
    path: Option<PathBuf>,
    records: Vec<ConnectionRecord>,
}

impl ConnectionStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`. A missing file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let path = path.into();

        let records = match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<StoreFile>(&contents) {
                Ok(file) if file.version > STORE_VERSION => {
                    return Err(RemoteError::Store(format!(
                        "{} has version {}, newer than supported {}",
                        path.display(),
                        file.version,
                        STORE_VERSION
                    )));
                }
                Ok(file) => dedupe(file.connections),
                Err(e) => {
                    warn!("Connection store {} is corrupted: {}", path.display(), e);
                    backup_corrupt(&path).await;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(RemoteError::Store(format!("read {}: {}", path.display(), e))),
        };

        debug!("Loaded {} connection(s) from {}", records.len(), path.display());
        Ok(Self {
            path: Some(path),
            records,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn records(&self) -> &[ConnectionRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a record. Names are unique.
    pub fn insert(&mut self, record: ConnectionRecord) -> Result<(), RemoteError> {
        validate_record(&record)?;
        if self.contains(&record.name) {
            return Err(RemoteError::DuplicateConnection(record.name));
        }
        self.records.push(record);
        Ok(())
    }

    /// Replace the record with the same name, keeping its position.
    ///
    /// Returns the previous record.
    pub fn replace(&mut self, record: ConnectionRecord) -> Result<ConnectionRecord, RemoteError> {
        validate_record(&record)?;
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.name == record.name)
            .ok_or_else(|| RemoteError::UnknownConnection(record.name.clone()))?;
        Ok(std::mem::replace(slot, record))
    }

    pub fn remove(&mut self, name: &str) -> Option<ConnectionRecord> {
        let index = self.records.iter().position(|r| r.name == name)?;
        Some(self.records.remove(index))
    }

    /// Persist saved records. No-op for in-memory stores.
    pub async fn save(&self) -> Result<(), RemoteError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = StoreFile {
            version: STORE_VERSION,
            connections: self.records.iter().filter(|r| r.saved).cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| RemoteError::Store(format!("serialize: {}", e)))?;

        write_atomic(path, json.as_bytes())
            .await
            .map_err(|e| RemoteError::Store(format!("write {}: {}", path.display(), e)))?;

        debug!("Saved {} connection(s) to {}", file.connections.len(), path.display());
        Ok(())
    }
}

fn validate_record(record: &ConnectionRecord) -> Result<(), RemoteError> {
    if record.name.trim().is_empty() {
        return Err(RemoteError::InvalidRequest(
            "connection name must not be empty".to_string(),
        ));
    }
    if record.hostname.trim().is_empty() {
        return Err(RemoteError::InvalidRequest(format!(
            "connection '{}' has no hostname",
            record.name
        )));
    }
    if record.username.trim().is_empty() {
        return Err(RemoteError::InvalidRequest(format!(
            "connection '{}' has no username",
            record.name
        )));
    }
    Ok(())
}

/// Keep the first record for each name.
fn dedupe(records: Vec<ConnectionRecord>) -> Vec<ConnectionRecord> {
    let mut out: Vec<ConnectionRecord> = Vec::with_capacity(records.len());
    for record in records {
        if out.iter().any(|r| r.name == record.name) {
            warn!("Dropping duplicate connection record '{}'", record.name);
            continue;
        }
        out.push(record);
    }
    out
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await
}

async fn backup_corrupt(path: &Path) {
    let backup = path.with_extension("json.corrupt");
    match fs::rename(path, &backup).await {
        Ok(()) => warn!("Corrupted connection store moved to {}", backup.display()),
        Err(e) => error!("Failed to back up corrupted store {}: {}", path.display(), e),
    }
}
