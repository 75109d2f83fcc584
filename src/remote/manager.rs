//! Session registry and connection management.
//!
//! [`RemoteManager`] is the single source of truth for which hosts are
//! reachable. It holds at most one session per connection name, in insertion
//! order, and owns the connection store plus the credential store behind it.
//!
//! # Locking
//!
//! - Operations on one name (connect, disconnect, update, remove, prune) are
//!   serialized by a per-name async lock, so two connects for the same name
//!   can never both open a transport.
//! - The session list is a `parking_lot::RwLock<Vec<_>>` touched only in
//!   short synchronous sections. Readers clone a snapshot and never iterate a
//!   list that is being mutated.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::config::RemoteConfig;
use super::error::RemoteError;
use super::events::{EventBus, RemoteEvent};
use super::session::RemoteSession;
use super::storage::{ConnectionStore, CredentialStore};
use super::transport::{Connector, Credential};
use super::types::{ConnectionRecord, CredentialRef, SessionInfo};

/// Authentication material supplied when a connection is created or edited.
///
/// Secrets are moved into the credential store; only references are kept.
#[derive(Clone)]
pub enum AuthInput {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl std::fmt::Debug for AuthInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthInput::Password(_) => f.write_str("Password(<redacted>)"),
            AuthInput::KeyFile { path, .. } => write!(f, "KeyFile({:?})", path),
            AuthInput::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub auth: AuthInput,
    pub saved: bool,
}

/// Fields to change on an existing record. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub auth: Option<AuthInput>,
    pub saved: Option<bool>,
}

/// Which sessions an operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    /// Every connected session, in registry order
    All,
    /// Named hosts, in the given order
    Hosts(Vec<String>),
}

impl HostFilter {
    fn matches(&self, name: &str) -> bool {
        match self {
            HostFilter::All => true,
            HostFilter::Hosts(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub session: Arc<RemoteSession>,
    /// True when a live session was reused
    pub reused: bool,
}

pub struct RemoteManager {
    config: RemoteConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    store: Mutex<ConnectionStore>,
    sessions: RwLock<Vec<Arc<RemoteSession>>>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    events: EventBus,
}

impl RemoteManager {
    pub fn new(
        config: RemoteConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        store: ConnectionStore,
    ) -> Self {
        Self {
            config,
            connector,
            credentials,
            store: Mutex::new(store),
            sessions: RwLock::new(Vec::new()),
            name_locks: DashMap::new(),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ---- sessions ------------------------------------------------------

    /// Connect the named record, reusing a live session when there is one.
    ///
    /// A dead session is torn down and replaced in its registry slot. If the
    /// replacement fails, the dead session is dropped from the registry.
    pub async fn connect(&self, name: &str) -> Result<ConnectOutcome, RemoteError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let record = self
            .store
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownConnection(name.to_string()))?;

        if let Some(existing) = self.session(name) {
            if existing.check_alive().await {
                info!("Reusing live session for {}", name);
                return Ok(ConnectOutcome {
                    session: existing,
                    reused: true,
                });
            }
            warn!("Session for {} is dead, reconnecting", name);
            existing.disconnect().await;
        }

        let credential = self.resolve_credential(&record.credential)?;
        let connected = RemoteSession::connect(
            self.connector.as_ref(),
            record,
            credential,
            &self.config,
            self.events.clone(),
        )
        .await;

        match connected {
            Ok(session) => {
                let session = Arc::new(session);
                self.install(session.clone());
                Ok(ConnectOutcome {
                    session,
                    reused: false,
                })
            }
            Err(e) => {
                self.sessions.write().retain(|s| s.name() != name);
                Err(e)
            }
        }
    }

    /// Tear down one session. Never fails; returns whether one existed.
    pub async fn disconnect(&self, name: &str) -> bool {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.disconnect_locked(name).await
    }

    async fn disconnect_locked(&self, name: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            sessions
                .iter()
                .position(|s| s.name() == name)
                .map(|index| sessions.remove(index))
        };

        match removed {
            Some(session) => {
                session.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every session. Returns the names that were registered.
    ///
    /// Each name is torn down under its lock, so a connect still in flight
    /// is waited for and its session closed too.
    pub async fn disconnect_all(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().iter().map(|s| s.name().to_string()).collect();
        let pending: Vec<String> = self.name_locks.iter().map(|e| e.key().clone()).collect();
        for name in pending {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let closed = join_all(names.iter().map(|name| async move {
            let lock = self.name_lock(name);
            let _guard = lock.lock().await;
            self.disconnect_locked(name).await.then(|| name.clone())
        }))
        .await;
        let names: Vec<String> = closed.into_iter().flatten().collect();

        if !names.is_empty() {
            info!("Disconnected {} session(s)", names.len());
        }
        names
    }

    /// Registered session for `name`, in any state.
    pub fn session(&self, name: &str) -> Option<Arc<RemoteSession>> {
        self.sessions.read().iter().find(|s| s.name() == name).cloned()
    }

    /// Live session for `name`, or `SessionClosed`.
    pub fn connected_session(&self, name: &str) -> Result<Arc<RemoteSession>, RemoteError> {
        self.session(name)
            .filter(|s| s.is_alive())
            .ok_or_else(|| RemoteError::session_closed(name))
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.session(name).is_some_and(|s| s.is_alive())
    }

    /// Live sessions matching `filter`, in insertion order.
    pub fn get_connected_sessions(&self, filter: &HostFilter) -> Vec<Arc<RemoteSession>> {
        self.snapshot()
            .into_iter()
            .filter(|s| filter.matches(s.name()) && s.is_alive())
            .collect()
    }

    /// Targets for a fan-out, resolved now.
    ///
    /// `All` yields live sessions in insertion order. A host list yields one
    /// entry per distinct name in request order, `None` where no live session
    /// exists.
    pub fn resolve_targets(&self, filter: &HostFilter) -> Vec<(String, Option<Arc<RemoteSession>>)> {
        let snapshot = self.snapshot();
        match filter {
            HostFilter::All => snapshot
                .into_iter()
                .filter(|s| s.is_alive())
                .map(|s| (s.name().to_string(), Some(s)))
                .collect(),
            HostFilter::Hosts(names) => {
                let mut seen: Vec<&str> = Vec::with_capacity(names.len());
                let mut targets = Vec::with_capacity(names.len());
                for name in names {
                    if seen.contains(&name.as_str()) {
                        continue;
                    }
                    seen.push(name.as_str());
                    let session = snapshot
                        .iter()
                        .find(|s| s.name() == name && s.is_alive())
                        .cloned();
                    targets.push((name.clone(), session));
                }
                targets
            }
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.snapshot().iter().map(|s| s.info()).collect()
    }

    /// Drop sessions that fail their liveness check. Returns their names.
    pub async fn prune_dead(&self) -> Vec<String> {
        let mut pruned = Vec::new();
        for session in self.snapshot() {
            if session.check_alive().await {
                continue;
            }
            let lock = self.name_lock(session.name());
            let _guard = lock.lock().await;

            let removed = {
                let mut sessions = self.sessions.write();
                let before = sessions.len();
                sessions.retain(|s| !Arc::ptr_eq(s, &session));
                sessions.len() != before
            };
            if removed {
                warn!("Pruning dead session {}", session.name());
                session.disconnect().await;
                pruned.push(session.name().to_string());
            }
        }
        pruned
    }

    fn snapshot(&self) -> Vec<Arc<RemoteSession>> {
        self.sessions.read().clone()
    }

    /// Put `session` in its name's slot, or append it.
    fn install(&self, session: Arc<RemoteSession>) {
        let mut sessions = self.sessions.write();
        match sessions.iter_mut().find(|s| s.name() == session.name()) {
            Some(slot) => *slot = session,
            None => sessions.push(session),
        }
    }

    fn resolve_credential(&self, reference: &CredentialRef) -> Result<Credential, RemoteError> {
        match reference {
            CredentialRef::Password { secret_id } => {
                Ok(Credential::Password(self.credentials.get(secret_id)?))
            }
            CredentialRef::KeyFile {
                path,
                passphrase_secret_id,
            } => {
                let passphrase = passphrase_secret_id
                    .as_deref()
                    .map(|id| self.credentials.get(id))
                    .transpose()?;
                Ok(Credential::KeyFile {
                    path: path.clone(),
                    passphrase,
                })
            }
            CredentialRef::Agent => Ok(Credential::Agent),
        }
    }

    // ---- connection records -------------------------------------------

    pub async fn list_connections(&self) -> Vec<ConnectionRecord> {
        self.store.lock().await.records().to_vec()
    }

    pub async fn get_connection(&self, name: &str) -> Option<ConnectionRecord> {
        self.store.lock().await.get(name).cloned()
    }

    /// Add a record. Secrets go to the credential store first and are
    /// removed again if the record cannot be stored.
    pub async fn add_connection(&self, new: NewConnection) -> Result<ConnectionRecord, RemoteError> {
        let lock = self.name_lock(&new.name);
        let _guard = lock.lock().await;

        let credential = self.store_secrets(&new.auth)?;
        let record = ConnectionRecord {
            name: new.name,
            hostname: new.hostname,
            username: new.username,
            credential,
            saved: new.saved,
        };

        let mut store = self.store.lock().await;
        if let Err(e) = store.insert(record.clone()) {
            self.delete_secrets(&record.credential);
            return Err(e);
        }
        if record.saved {
            if let Err(e) = store.save().await {
                store.remove(&record.name);
                self.delete_secrets(&record.credential);
                return Err(e);
            }
        }

        info!("Added connection {} ({}@{})", record.name, record.username, record.hostname);
        Ok(record)
    }

    /// Edit a record. Refused while a live session exists for it.
    pub async fn update_connection(
        &self,
        name: &str,
        update: ConnectionUpdate,
    ) -> Result<ConnectionRecord, RemoteError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if self.is_connected(name) {
            return Err(RemoteError::ConnectionActive(name.to_string()));
        }

        let mut store = self.store.lock().await;
        let current = store
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownConnection(name.to_string()))?;

        let new_credential = update.auth.as_ref().map(|a| self.store_secrets(a)).transpose()?;
        let record = ConnectionRecord {
            name: current.name.clone(),
            hostname: update.hostname.unwrap_or_else(|| current.hostname.clone()),
            username: update.username.unwrap_or_else(|| current.username.clone()),
            credential: new_credential.clone().unwrap_or_else(|| current.credential.clone()),
            saved: update.saved.unwrap_or(current.saved),
        };

        let rollback = |store: &mut ConnectionStore| {
            if let Some(credential) = &new_credential {
                self.delete_secrets(credential);
            }
            let _ = store.replace(current.clone());
        };

        if let Err(e) = store.replace(record.clone()) {
            rollback(&mut *store);
            return Err(e);
        }
        if record.saved || current.saved {
            if let Err(e) = store.save().await {
                rollback(&mut *store);
                return Err(e);
            }
        }
        if new_credential.is_some() {
            self.delete_secrets(&current.credential);
        }

        info!("Updated connection {}", name);
        Ok(record)
    }

    /// Remove a record, disconnecting its session first.
    pub async fn remove_connection(&self, name: &str) -> Result<ConnectionRecord, RemoteError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if self.disconnect_locked(name).await {
            info!("Disconnected {} before removal", name);
        }

        let mut store = self.store.lock().await;
        let record = store
            .remove(name)
            .ok_or_else(|| RemoteError::UnknownConnection(name.to_string()))?;
        if record.saved {
            if let Err(e) = store.save().await {
                // Put it back so memory and disk agree.
                let _ = store.insert(record);
                return Err(e);
            }
        }
        drop(store);

        self.delete_secrets(&record.credential);
        // Waiters still hold the old lock; keep it so they stay serialized.
        self.name_locks
            .remove_if(name, |_, l| Arc::strong_count(l) == 2);
        info!("Removed connection {}", name);
        Ok(record)
    }

    fn store_secrets(&self, auth: &AuthInput) -> Result<CredentialRef, RemoteError> {
        match auth {
            AuthInput::Password(password) => Ok(CredentialRef::Password {
                secret_id: self.credentials.store_new(password)?,
            }),
            AuthInput::KeyFile { path, passphrase } => {
                let passphrase_secret_id = passphrase
                    .as_deref()
                    .map(|p| self.credentials.store_new(p))
                    .transpose()?;
                Ok(CredentialRef::KeyFile {
                    path: path.clone(),
                    passphrase_secret_id,
                })
            }
            AuthInput::Agent => Ok(CredentialRef::Agent),
        }
    }

    /// Best effort; failures are logged.
    fn delete_secrets(&self, reference: &CredentialRef) {
        for id in reference.secret_ids() {
            if let Err(e) = self.credentials.delete(id) {
                warn!("Failed to delete secret {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remote::error::ErrorKind;
    use crate::remote::storage::MemoryCredentialStore;
    use crate::remote::testing::{FakeConnector, FakeHost, test_config};
    use crate::remote::types::SessionState;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub manager: Arc<RemoteManager>,
        pub connector: Arc<FakeConnector>,
        pub credentials: Arc<MemoryCredentialStore>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self::with_config(test_config())
        }

        pub(crate) fn with_config(config: RemoteConfig) -> Self {
            let connector = Arc::new(FakeConnector::new());
            let credentials = Arc::new(MemoryCredentialStore::default());
            let manager = Arc::new(RemoteManager::new(
                config,
                connector.clone(),
                credentials.clone(),
                ConnectionStore::in_memory(),
            ));
            Self {
                manager,
                connector,
                credentials,
            }
        }

        /// Register host `name` (hostname `pc-<name>`) with a record using `password`.
        pub(crate) async fn host(&self, name: &str, password: &str) -> Arc<FakeHost> {
            let hostname = format!("pc-{}", name.to_lowercase());
            let host = self.connector.add_host(&hostname, "secret");
            self.manager
                .add_connection(NewConnection {
                    name: name.to_string(),
                    hostname,
                    username: "administrator".to_string(),
                    auth: AuthInput::Password(password.to_string()),
                    saved: true,
                })
                .await
                .unwrap();
            host
        }
    }

    mod connect {
        use super::*;

        #[tokio::test]
        async fn test_valid_then_invalid_credentials() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            fx.host("B", "wrong").await;

            fx.manager.connect("A").await.unwrap();
            let names: Vec<String> = fx.manager.list_sessions().into_iter().map(|s| s.name).collect();
            assert_eq!(names, vec!["A"]);

            let err = fx.manager.connect("B").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Auth);
            let names: Vec<String> = fx.manager.list_sessions().into_iter().map(|s| s.name).collect();
            assert_eq!(names, vec!["A"]);
            assert!(fx.manager.is_connected("A"));
            assert!(!fx.manager.is_connected("B"));
        }

        #[tokio::test]
        async fn test_connect_twice_reuses() {
            let fx = Fixture::new();
            let host = fx.host("A", "secret").await;

            let first = fx.manager.connect("A").await.unwrap();
            let second = fx.manager.connect("A").await.unwrap();
            assert!(!first.reused);
            assert!(second.reused);
            assert!(Arc::ptr_eq(&first.session, &second.session));
            assert_eq!(fx.manager.list_sessions().len(), 1);
            assert_eq!(host.opens(), 1);
        }

        #[tokio::test]
        async fn test_concurrent_connects_open_once() {
            let fx = Fixture::new();
            let host = fx.host("A", "secret").await;

            let (a, b) = tokio::join!(fx.manager.connect("A"), fx.manager.connect("A"));
            assert!(a.unwrap().reused ^ b.unwrap().reused);
            assert_eq!(host.opens(), 1);
            assert_eq!(fx.manager.list_sessions().len(), 1);
        }

        #[tokio::test]
        async fn test_dead_session_is_replaced_in_place() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            let host_b = fx.host("B", "secret").await;
            fx.manager.connect("A").await.unwrap();
            let old = fx.manager.connect("B").await.unwrap().session;
            fx.host("C", "secret").await;
            fx.manager.connect("C").await.unwrap();

            host_b.kill();
            assert!(!fx.manager.is_connected("B"));

            // Fresh transports work again once the host is reachable.
            let fresh = fx.connector.add_host("pc-b", "secret");
            let outcome = fx.manager.connect("B").await.unwrap();
            assert!(!outcome.reused);
            assert_eq!(fresh.opens(), 1);
            assert_eq!(old.state(), SessionState::Disconnected);

            let names: Vec<String> = fx.manager.list_sessions().into_iter().map(|s| s.name).collect();
            assert_eq!(names, vec!["A", "B", "C"]);
        }

        #[tokio::test]
        async fn test_failed_reconnect_drops_dead_session() {
            let fx = Fixture::new();
            let host = fx.host("A", "secret").await;
            fx.manager.connect("A").await.unwrap();
            host.kill();

            let err = fx.manager.connect("A").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Network);
            assert!(fx.manager.list_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_busy_session_is_reused() {
            let mut config = test_config();
            config.liveness_idle = Duration::from_millis(50);
            config.connect_timeout = Duration::from_millis(200);
            let fx = Fixture::with_config(config);
            let host = fx.host("A", "secret").await;
            host.set_exec_latency(Duration::from_millis(600));
            let first = fx.manager.connect("A").await.unwrap();

            let running = {
                let session = first.session.clone();
                tokio::spawn(async move {
                    let op = crate::remote::operation::OperationKind::ListEnvironmentVariables {
                        scope: crate::remote::operation::EnvScope::User,
                    };
                    session.execute(&op, Duration::from_secs(5)).await
                })
            };
            tokio::time::sleep(Duration::from_millis(300)).await;

            let second = fx.manager.connect("A").await.unwrap();
            assert!(second.reused);
            assert!(Arc::ptr_eq(&first.session, &second.session));
            assert_eq!(host.opens(), 1);
            assert!(running.await.unwrap().is_ok());
            assert!(fx.manager.prune_dead().await.is_empty());
        }

        #[tokio::test]
        async fn test_unknown_name() {
            let fx = Fixture::new();
            assert_eq!(
                fx.manager.connect("nope").await.unwrap_err(),
                RemoteError::UnknownConnection("nope".into())
            );
        }
    }

    mod disconnect {
        use super::*;

        #[tokio::test]
        async fn test_reports_whether_session_existed() {
            let fx = Fixture::new();
            let host = fx.host("A", "secret").await;
            fx.manager.connect("A").await.unwrap();

            assert!(fx.manager.disconnect("A").await);
            assert!(!fx.manager.disconnect("A").await);
            assert!(!fx.manager.disconnect("never").await);
            assert_eq!(host.live_transports(), 0);
        }

        #[tokio::test]
        async fn test_disconnect_all() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            fx.host("B", "secret").await;
            fx.manager.connect("A").await.unwrap();
            fx.manager.connect("B").await.unwrap();

            assert_eq!(fx.manager.disconnect_all().await, vec!["A", "B"]);
            assert!(fx.manager.list_sessions().is_empty());
            assert!(fx.manager.disconnect_all().await.is_empty());
        }

        #[tokio::test]
        async fn test_disconnect_all_waits_for_connect_in_flight() {
            let mut config = test_config();
            config.retry_delay = Duration::from_millis(150);
            let fx = Fixture::with_config(config);
            let host = fx.host("A", "secret").await;
            host.fail_next_connects(1);

            let connecting = {
                let manager = fx.manager.clone();
                tokio::spawn(async move { manager.connect("A").await })
            };
            tokio::time::sleep(Duration::from_millis(30)).await;

            assert_eq!(fx.manager.disconnect_all().await, vec!["A"]);
            let session = connecting.await.unwrap().unwrap().session;
            assert_eq!(session.state(), SessionState::Disconnected);
            assert!(fx.manager.list_sessions().is_empty());
            assert_eq!(host.live_transports(), 0);
        }

        #[tokio::test]
        async fn test_emits_disconnected_event() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            fx.manager.connect("A").await.unwrap();
            let mut rx = fx.manager.subscribe();

            fx.manager.disconnect("A").await;
            match rx.recv().await.unwrap() {
                RemoteEvent::SessionState { name, state, .. } => {
                    assert_eq!(name, "A");
                    assert_eq!(state, SessionState::Disconnected);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    mod registry {
        use super::*;

        #[tokio::test]
        async fn test_connected_sessions_in_insertion_order() {
            let fx = Fixture::new();
            for name in ["C", "A", "B"] {
                fx.host(name, "secret").await;
                fx.manager.connect(name).await.unwrap();
            }
            let all: Vec<String> = fx
                .manager
                .get_connected_sessions(&HostFilter::All)
                .iter()
                .map(|s| s.name().to_string())
                .collect();
            assert_eq!(all, vec!["C", "A", "B"]);

            let some: Vec<String> = fx
                .manager
                .get_connected_sessions(&HostFilter::Hosts(vec!["B".into(), "C".into()]))
                .iter()
                .map(|s| s.name().to_string())
                .collect();
            assert_eq!(some, vec!["C", "B"]);
        }

        #[tokio::test]
        async fn test_resolve_targets_keeps_request_order_and_dedupes() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            fx.manager.connect("A").await.unwrap();

            let targets = fx.manager.resolve_targets(&HostFilter::Hosts(vec![
                "B".into(),
                "A".into(),
                "B".into(),
            ]));
            let shape: Vec<(String, bool)> =
                targets.into_iter().map(|(n, s)| (n, s.is_some())).collect();
            assert_eq!(shape, vec![("B".into(), false), ("A".into(), true)]);
        }

        #[tokio::test]
        async fn test_prune_dead() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            let host_b = fx.host("B", "secret").await;
            fx.manager.connect("A").await.unwrap();
            fx.manager.connect("B").await.unwrap();
            host_b.kill();

            assert_eq!(fx.manager.prune_dead().await, vec!["B"]);
            assert_eq!(fx.manager.list_sessions().len(), 1);
            assert!(fx.manager.prune_dead().await.is_empty());
        }
    }

    mod records {
        use super::*;

        #[tokio::test]
        async fn test_add_keeps_password_out_of_record() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            let record = fx.manager.get_connection("A").await.unwrap();
            let json = serde_json::to_string(&record).unwrap();
            assert!(!json.contains("secret\""));
            assert_eq!(fx.credentials.len(), 1);
        }

        #[tokio::test]
        async fn test_duplicate_add_rolls_back_secret() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            let err = fx
                .manager
                .add_connection(NewConnection {
                    name: "A".into(),
                    hostname: "elsewhere".into(),
                    username: "admin".into(),
                    auth: AuthInput::Password("other".into()),
                    saved: true,
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DuplicateConnection);
            assert_eq!(fx.credentials.len(), 1);
        }

        #[tokio::test]
        async fn test_update_refused_while_live() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            fx.manager.connect("A").await.unwrap();

            let err = fx
                .manager
                .update_connection(
                    "A",
                    ConnectionUpdate {
                        hostname: Some("10.0.0.9".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionActive);

            fx.manager.disconnect("A").await;
            let record = fx
                .manager
                .update_connection(
                    "A",
                    ConnectionUpdate {
                        hostname: Some("10.0.0.9".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(record.hostname, "10.0.0.9");
        }

        #[tokio::test]
        async fn test_update_password_replaces_secret() {
            let fx = Fixture::new();
            fx.host("A", "wrong").await;
            assert!(fx.manager.connect("A").await.is_err());

            fx.manager
                .update_connection(
                    "A",
                    ConnectionUpdate {
                        auth: Some(AuthInput::Password("secret".into())),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(fx.credentials.len(), 1);
            fx.manager.connect("A").await.unwrap();
        }

        #[tokio::test]
        async fn test_remove_disconnects_and_deletes_secret() {
            let fx = Fixture::new();
            let host = fx.host("A", "secret").await;
            fx.manager.connect("A").await.unwrap();

            fx.manager.remove_connection("A").await.unwrap();
            assert!(!fx.manager.is_connected("A"));
            assert_eq!(host.live_transports(), 0);
            assert!(fx.credentials.is_empty());
            assert!(fx.manager.list_connections().await.is_empty());
            assert_eq!(
                fx.manager.remove_connection("A").await.unwrap_err(),
                RemoteError::UnknownConnection("A".into())
            );
        }

        #[tokio::test]
        async fn test_remove_keeps_lock_held_by_waiters() {
            let fx = Fixture::new();
            fx.host("A", "secret").await;
            fx.host("B", "secret").await;
            let waiter = fx.manager.name_lock("A");

            fx.manager.remove_connection("A").await.unwrap();
            fx.manager.remove_connection("B").await.unwrap();
            assert!(Arc::ptr_eq(&waiter, &fx.manager.name_lock("A")));
            assert!(!fx.manager.name_locks.contains_key("B"));
        }

        #[tokio::test]
        async fn test_records_persist_through_file_store() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("connections.json");
            let credentials = Arc::new(MemoryCredentialStore::default());
            let manager = RemoteManager::new(
                test_config(),
                Arc::new(FakeConnector::new()),
                credentials.clone(),
                ConnectionStore::load(&path).await.unwrap(),
            );
            manager
                .add_connection(NewConnection {
                    name: "A".into(),
                    hostname: "pc-a".into(),
                    username: "admin".into(),
                    auth: AuthInput::Password("secret".into()),
                    saved: true,
                })
                .await
                .unwrap();

            let reloaded = ConnectionStore::load(&path).await.unwrap();
            assert_eq!(reloaded.records().len(), 1);
            assert!(!std::fs::read_to_string(&path).unwrap().contains("\"secret\""));
        }
    }
}
