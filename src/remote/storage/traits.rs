//! Credential storage trait.
//!
//! Implementations must be thread-safe (`Send + Sync`): the manager resolves
//! secrets from async tasks.

use crate::remote::error::RemoteError;

/// Secret storage keyed by opaque ids.
pub trait CredentialStore: Send + Sync {
    /// Store a secret under a fresh id and return the id.
    fn store_new(&self, secret: &str) -> Result<String, RemoteError>;

    /// Fetch a secret by id.
    fn get(&self, id: &str) -> Result<String, RemoteError>;

    /// Delete a secret. Deleting a missing id succeeds.
    fn delete(&self, id: &str) -> Result<(), RemoteError>;
}
