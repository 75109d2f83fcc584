//! Password authentication for Windows OpenSSH accounts.

use std::fmt;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::remote::client::SshClientHandler;

use super::traits::AuthStrategy;

/// Authenticates with the account password resolved from the credential
/// store. The secret is only ever handed to the SSH userauth exchange.
pub struct PasswordAuth {
    secret: String,
}

impl PasswordAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        // Windows accounts without a password cannot log in over SSH
        if self.secret.is_empty() {
            debug!("Skipping password auth for {}: empty secret", username);
            return Ok(false);
        }

        let outcome = handle
            .authenticate_password(username, self.secret.as_str())
            .await
            .map_err(|e| format!("Password exchange for {} failed: {}", username, e))?;

        Ok(outcome.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
