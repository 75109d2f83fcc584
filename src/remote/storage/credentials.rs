//! Credential store implementations.

use dashmap::DashMap;
use keyring::Entry;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::remote::error::RemoteError;

use super::traits::CredentialStore;

/// Service name for keychain entries
const SERVICE_NAME: &str = "winadmin.remote";

fn generate_id() -> String {
    format!("winadmin-{}", Uuid::new_v4())
}

/// OS credential manager (Windows Credential Manager, macOS Keychain,
/// Secret Service) via `keyring`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, id: &str) -> Result<Entry, RemoteError> {
        Entry::new(&self.service, id).map_err(|e| RemoteError::Credential(e.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store_new(&self, secret: &str) -> Result<String, RemoteError> {
        let id = generate_id();
        self.entry(&id)?
            .set_password(secret)
            .map_err(|e| RemoteError::Credential(format!("store {}: {}", id, e)))?;
        debug!("Stored secret {} in keychain service {}", id, self.service);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<String, RemoteError> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => {
                Err(RemoteError::Credential(format!("no secret stored for {}", id)))
            }
            Err(e) => Err(RemoteError::Credential(format!("read {}: {}", id, e))),
        }
    }

    fn delete(&self, id: &str) -> Result<(), RemoteError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                warn!("Failed to delete secret {}: {}", id, e);
                Err(RemoteError::Credential(format!("delete {}: {}", id, e)))
            }
        }
    }
}

/// Process-local secret storage.
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: DashMap<String, String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn store_new(&self, secret: &str) -> Result<String, RemoteError> {
        let id = generate_id();
        self.secrets.insert(id.clone(), secret.to_string());
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<String, RemoteError> {
        self.secrets
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| RemoteError::Credential(format!("no secret stored for {}", id)))
    }

    fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.secrets.remove(id);
        Ok(())
    }
}
