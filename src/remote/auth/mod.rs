//! SSH authentication strategies.
//!
//! A connection record names one credential method; the connector turns the
//! resolved [`Credential`](super::transport::Credential) into an [`AuthChain`]
//! of strategies tried in order.
//!
//! - [`PasswordAuth`]: password from the OS credential store
//! - [`KeyAuth`]: private key file, optionally passphrase-protected
//! - [`AgentAuth`]: identities held by the SSH agent

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
