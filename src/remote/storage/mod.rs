//! Persistence for connection records and their secrets.
//!
//! - [`ConnectionStore`]: JSON file of named targets, no secrets
//! - [`CredentialStore`]: where secrets live; [`KeyringCredentialStore`]
//!   uses the OS credential manager, [`MemoryCredentialStore`] keeps them in
//!   process memory for tests and embedding

mod connections;
mod credentials;
mod traits;

pub use connections::{ConnectionStore, STORE_VERSION};
pub use credentials::{KeyringCredentialStore, MemoryCredentialStore};
pub use traits::CredentialStore;
