//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::remote::client::SshClientHandler;

/// One way of proving identity to an SSH server.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate.
    ///
    /// * `Ok(true)` - accepted
    /// * `Ok(false)` - rejected by the server
    /// * `Err(message)` - the attempt itself failed (unreadable key, no agent)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}
