use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::{
    parse_collection_list, parse_database_list, BackendError, SessionBackend, SessionConfig,
};
use crate::connection_tree::{ConnectionTree, DatabaseNode, SelectionCursor};
use crate::loading::LoadingFlag;
use crate::profiles::ConnectionProfile;
use crate::results::QueryOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected { profile_id: String, database: String },
    SwitchingDatabase,
    Disconnecting,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection profile `{0}` does not exist")]
    UnknownProfile(String),
    #[error("connection `{0}` is not the active session")]
    NotActive(String),
    #[error("connection failed: {0}")]
    Connection(#[source] BackendError),
    #[error("backend declined to open a session")]
    Refused,
    #[error("failed to list databases: {0}")]
    DatabaseListing(#[source] BackendError),
    #[error("switching to database `{database}` failed: {source}")]
    Switch {
        database: String,
        #[source]
        source: BackendError,
    },
}

impl SessionError {
    /// The result-shaped value rendered in place of query output.
    #[must_use]
    pub fn to_outcome(&self, duration: f64) -> QueryOutcome {
        QueryOutcome::failure(self.to_string(), duration)
    }
}

/// Owns the single backend session slot together with the connection tree
/// and selection cursor it drives.
#[derive(Debug)]
pub struct SessionController<B: SessionBackend> {
    backend: Arc<B>,
    tree: ConnectionTree,
    selection: SelectionCursor,
    state: SessionState,
    loading: LoadingFlag,
    fallback_database: Option<String>,
}

impl<B: SessionBackend> SessionController<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, tree: ConnectionTree, loading: LoadingFlag) -> Self {
        Self {
            backend,
            tree,
            selection: SelectionCursor::default(),
            state: SessionState::Disconnected,
            loading,
            fallback_database: None,
        }
    }

    #[must_use]
    pub fn with_fallback_database(mut self, database: Option<String>) -> Self {
        self.fallback_database = database.filter(|name| !name.trim().is_empty());
        self
    }

    #[must_use]
    pub fn tree(&self) -> &ConnectionTree {
        &self.tree
    }

    #[must_use]
    pub fn selection(&self) -> &SelectionCursor {
        &self.selection
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected { .. })
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading.is_loading()
    }

    pub fn add_profile(&mut self, profile: ConnectionProfile) {
        self.tree.push(profile);
    }

    /// Drops a node from the tree. The caller disconnects first when the
    /// node bears the live session.
    pub fn remove_profile(&mut self, id: &str) -> bool {
        self.tree.remove(id).is_some()
    }

    pub fn toggle_expand(&mut self, id: &str) -> bool {
        self.tree.toggle_expand(id)
    }

    pub fn select(&mut self, database: &str, collection: Option<&str>) {
        self.selection.select(database, collection);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    fn session_database(&self, profile: &ConnectionProfile) -> String {
        profile
            .configured_database()
            .or(self.fallback_database.as_deref())
            .unwrap_or_else(|| self.backend.administrative_database())
            .to_string()
    }

    /// Opens a session for `profile_id`, replacing any current one, then
    /// discovers every database and its collections.
    pub async fn connect(&mut self, profile_id: &str) -> Result<(), SessionError> {
        let profile = self
            .tree
            .node(profile_id)
            .map(|node| node.profile.clone())
            .ok_or_else(|| SessionError::UnknownProfile(profile_id.to_string()))?;

        if self.is_connected() {
            self.disconnect().await;
        }

        let _busy = self.loading.begin();
        self.state = SessionState::Connecting;
        let database = self.session_database(&profile);
        info!(profile = %profile.name, host = %profile.host, %database, "opening session");

        if let Err(error) = self.open(&profile, &database).await {
            self.reset_to_disconnected();
            return Err(error);
        }

        let databases = match self.discover_databases().await {
            Ok(databases) => databases,
            Err(error) => {
                if let Err(close_error) = self.backend.close_session().await {
                    error!(error = %close_error, "failed to close session after discovery failure");
                }
                self.reset_to_disconnected();
                return Err(error);
            }
        };

        let default_database = profile
            .configured_database()
            .map(str::to_string)
            .or_else(|| databases.first().map(|database| database.name.clone()));
        let first_collection = default_database.as_deref().and_then(|name| {
            databases
                .iter()
                .find(|database| database.name == name)
                .and_then(|database| database.collections.first().cloned())
        });

        self.tree.replace_databases(profile_id, databases);
        self.tree.activate(profile_id);
        self.state = SessionState::Connected {
            profile_id: profile_id.to_string(),
            database,
        };
        match default_database {
            Some(name) => self.selection.select(&name, first_collection.as_deref()),
            None => self.selection.clear(),
        }

        info!(profile = %profile.name, "session connected");
        Ok(())
    }

    async fn open(&self, profile: &ConnectionProfile, database: &str) -> Result<(), SessionError> {
        let config = SessionConfig::for_profile(profile, database);
        match self.backend.open_session(&config).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SessionError::Refused),
            Err(error) => Err(SessionError::Connection(error)),
        }
    }

    /// One listing call for the databases, then one per database, in order.
    /// A database whose collections cannot be listed keeps an empty list.
    async fn discover_databases(&self) -> Result<Vec<DatabaseNode>, SessionError> {
        let names = self
            .backend
            .list_databases()
            .await
            .and_then(|raw| parse_database_list(&raw))
            .map_err(SessionError::DatabaseListing)?;

        let mut databases = Vec::with_capacity(names.len());
        for name in names {
            let collections = self.discover_collections(&name).await;
            databases.push(DatabaseNode::new(name, collections));
        }
        Ok(databases)
    }

    async fn discover_collections(&self, database: &str) -> Vec<String> {
        match self
            .backend
            .list_collections(database)
            .await
            .and_then(|raw| parse_collection_list(&raw))
        {
            Ok(collections) => collections,
            Err(error) => {
                warn!(%database, %error, "failed to list collections; showing none");
                Vec::new()
            }
        }
    }

    /// Rebinds the live session to `database`: close, reopen with the same
    /// credentials, then refresh that one database's collections. The tree
    /// changes only once the whole round-trip has succeeded.
    pub async fn switch_database(
        &mut self,
        profile_id: &str,
        database: &str,
    ) -> Result<(), SessionError> {
        let profile = self
            .tree
            .node(profile_id)
            .map(|node| node.profile.clone())
            .ok_or_else(|| SessionError::UnknownProfile(profile_id.to_string()))?;
        let previous_database = match &self.state {
            SessionState::Connected {
                profile_id: active,
                database,
            } if active == profile_id => database.clone(),
            _ => return Err(SessionError::NotActive(profile_id.to_string())),
        };

        let _busy = self.loading.begin();
        self.state = SessionState::SwitchingDatabase;
        info!(profile = %profile.name, from = %previous_database, to = %database, "switching database");

        if let Err(source) = self.backend.close_session().await {
            self.state = SessionState::Connected {
                profile_id: profile_id.to_string(),
                database: previous_database,
            };
            return Err(SessionError::Switch {
                database: database.to_string(),
                source,
            });
        }

        if let Err(error) = self.open(&profile, database).await {
            let source = match error {
                SessionError::Connection(source) => source,
                other => BackendError::new(other.to_string()),
            };
            self.restore_session(&profile, &previous_database).await;
            return Err(SessionError::Switch {
                database: database.to_string(),
                source,
            });
        }

        let collections = self.discover_collections(database).await;
        let first_collection = collections.first().cloned();
        self.tree.apply_switch(profile_id, database, collections);
        self.state = SessionState::Connected {
            profile_id: profile_id.to_string(),
            database: database.to_string(),
        };
        self.selection.select(database, first_collection.as_deref());
        Ok(())
    }

    /// After a failed switch the old session is already closed; reopen it so
    /// the unchanged tree still matches a live session.
    async fn restore_session(&mut self, profile: &ConnectionProfile, database: &str) {
        match self.open(profile, database).await {
            Ok(()) => {
                self.state = SessionState::Connected {
                    profile_id: profile.id.clone(),
                    database: database.to_string(),
                };
            }
            Err(error) => {
                warn!(%error, %database, "could not restore previous session");
                self.reset_to_disconnected();
            }
        }
    }

    /// Always ends `Disconnected` with no active node and no selection; a
    /// backend failure is only logged.
    pub async fn disconnect(&mut self) {
        let _busy = self.loading.begin();
        self.state = SessionState::Disconnecting;
        if let Err(error) = self.backend.close_session().await {
            error!(%error, "backend failed to close session");
        }
        self.reset_to_disconnected();
        info!("session disconnected");
    }

    fn reset_to_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.tree.deactivate();
        self.selection.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::{SessionController, SessionError, SessionState};
    use crate::backend::{BackendError, QueryPayload, SessionBackend, SessionConfig};
    use crate::connection_tree::ConnectionTree;
    use crate::loading::LoadingFlag;
    use crate::profiles::ConnectionProfile;

    #[derive(Debug, Default)]
    struct FakeSessionBackend {
        databases: Vec<&'static str>,
        collections: HashMap<&'static str, Vec<&'static str>>,
        failing_listings: HashSet<&'static str>,
        refused_databases: HashSet<&'static str>,
        fail_close: bool,
        open_limit: Option<usize>,
        calls: Mutex<Vec<String>>,
        opened: Mutex<Vec<SessionConfig>>,
    }

    impl FakeSessionBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn opened_databases(&self) -> Vec<String> {
            self.opened
                .lock()
                .expect("opened lock")
                .iter()
                .map(|config| config.database.clone())
                .collect()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().expect("calls lock").push(call.into());
        }
    }

    #[async_trait::async_trait]
    impl SessionBackend for FakeSessionBackend {
        async fn open_session(&self, config: &SessionConfig) -> Result<bool, BackendError> {
            self.record(format!("open:{}", config.database));
            if self.refused_databases.contains(config.database.as_str()) {
                return Err(BackendError::new(format!(
                    "database \"{}\" does not exist",
                    config.database
                )));
            }
            let mut opened = self.opened.lock().expect("opened lock");
            if self.open_limit.is_some_and(|limit| opened.len() >= limit) {
                return Err(BackendError::new("too many connections"));
            }
            opened.push(config.clone());
            Ok(true)
        }

        async fn close_session(&self) -> Result<(), BackendError> {
            self.record("close");
            if self.fail_close {
                return Err(BackendError::new("close failed"));
            }
            Ok(())
        }

        async fn list_databases(&self) -> Result<String, BackendError> {
            self.record("list_databases");
            Ok(serde_json::json!({ "databases": self.databases }).to_string())
        }

        async fn list_collections(&self, database: &str) -> Result<String, BackendError> {
            self.record(format!("list_collections:{database}"));
            if self.failing_listings.contains(database) {
                return Err(BackendError::new("permission denied"));
            }
            let collections = self.collections.get(database).cloned().unwrap_or_default();
            Ok(serde_json::json!({ "collections": collections }).to_string())
        }

        async fn execute_query(&self, _payload: QueryPayload) -> Result<String, BackendError> {
            Ok("{}".to_string())
        }
    }

    fn profile(id: &str, database: Option<&str>) -> ConnectionProfile {
        ConnectionProfile {
            id: id.to_string(),
            name: format!("conn-{id}"),
            host: "localhost".to_string(),
            port: 5432,
            username: "a".to_string(),
            password: String::new(),
            database: database.map(str::to_string),
        }
    }

    fn standard_backend() -> FakeSessionBackend {
        FakeSessionBackend {
            databases: vec!["postgres", "app"],
            collections: HashMap::from([
                ("postgres", vec![]),
                ("app", vec!["public.users", "public.orders"]),
            ]),
            ..FakeSessionBackend::default()
        }
    }

    fn controller(
        backend: FakeSessionBackend,
        profiles: &[ConnectionProfile],
    ) -> (SessionController<FakeSessionBackend>, Arc<FakeSessionBackend>) {
        let backend = Arc::new(backend);
        let controller = SessionController::new(
            Arc::clone(&backend),
            ConnectionTree::from_profiles(profiles),
            LoadingFlag::new(),
        );
        (controller, backend)
    }

    #[tokio::test]
    async fn connect_without_configured_database_selects_first_discovered() {
        let (mut controller, backend) =
            controller(standard_backend(), &[profile("1", Some("")), profile("2", None)]);

        controller.connect("1").await.expect("connect should succeed");

        let node = controller.tree().node("1").expect("node exists");
        assert_eq!(node.databases.len(), 2);
        assert!(node.expanded);
        assert_eq!(controller.selection().database(), Some("postgres"));
        assert_eq!(controller.selection().collection(), None);
        assert_eq!(backend.opened_databases(), vec!["postgres"]);
        assert_eq!(
            backend.calls(),
            vec![
                "open:postgres",
                "list_databases",
                "list_collections:postgres",
                "list_collections:app",
            ]
        );
        assert_eq!(
            controller.state(),
            &SessionState::Connected {
                profile_id: "1".to_string(),
                database: "postgres".to_string(),
            }
        );
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn connect_with_configured_database_selects_it_and_first_collection() {
        let (mut controller, backend) = controller(standard_backend(), &[profile("1", Some("app"))]);

        controller.connect("1").await.expect("connect should succeed");

        assert_eq!(backend.opened_databases(), vec!["app"]);
        assert_eq!(controller.selection().database(), Some("app"));
        assert_eq!(controller.selection().collection(), Some("public.users"));
    }

    #[tokio::test]
    async fn fallback_database_setting_overrides_backend_default() {
        let (controller, backend) = controller(standard_backend(), &[profile("1", None)]);
        let mut controller = controller.with_fallback_database(Some("template1".to_string()));

        controller.connect("1").await.expect("connect should succeed");
        assert_eq!(backend.opened_databases(), vec!["template1"]);
    }

    #[tokio::test]
    async fn collection_listing_failure_keeps_database_with_empty_list() {
        let mut backend = standard_backend();
        backend.failing_listings.insert("app");
        let (mut controller, _backend) = controller(backend, &[profile("1", Some("app"))]);

        controller.connect("1").await.expect("connect should not abort");

        let node = controller.tree().node("1").expect("node exists");
        assert_eq!(
            node.database("app").map(|database| database.collections.len()),
            Some(0)
        );
        assert!(controller.is_connected());
        assert_eq!(controller.selection().database(), Some("app"));
        assert!(controller.selection().collection().is_none());
    }

    #[tokio::test]
    async fn failed_connect_leaves_session_disconnected() {
        let mut backend = standard_backend();
        backend.refused_databases.insert("postgres");
        let (mut controller, _backend) = controller(backend, &[profile("1", None)]);

        let err = controller.connect("1").await.expect_err("connect should fail");
        assert!(matches!(err, SessionError::Connection(_)));
        assert_eq!(controller.state(), &SessionState::Disconnected);
        assert!(controller.tree().active_id().is_none());
        assert!(controller.tree().node("1").is_some_and(|node| node.databases.is_empty()));
    }

    #[tokio::test]
    async fn connecting_another_profile_closes_previous_session_and_collapses_it() {
        let (mut controller, backend) = controller(
            standard_backend(),
            &[profile("1", Some("app")), profile("2", Some("postgres"))],
        );

        controller.connect("1").await.expect("first connect");
        controller.connect("2").await.expect("second connect");

        assert_eq!(controller.tree().active_id(), Some("2"));
        assert!(controller.tree().node("1").is_some_and(|node| !node.expanded));
        assert!(controller.tree().node("2").is_some_and(|node| node.expanded));
        assert!(backend.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn switch_database_reconnects_and_patches_only_that_database() {
        let (mut controller, backend) = controller(standard_backend(), &[profile("1", None)]);
        controller.connect("1").await.expect("connect should succeed");
        let postgres_before = controller
            .tree()
            .node("1")
            .and_then(|node| node.database("postgres").cloned());

        controller
            .switch_database("1", "app")
            .await
            .expect("switch should succeed");

        let node = controller.tree().node("1").expect("node exists");
        assert_eq!(node.profile.configured_database(), Some("app"));
        assert!(node.expanded);
        assert_eq!(node.database("postgres").cloned(), postgres_before);
        assert_eq!(controller.selection().database(), Some("app"));
        assert_eq!(controller.selection().collection(), Some("public.users"));
        assert_eq!(backend.opened_databases(), vec!["postgres", "app"]);
        assert_eq!(
            backend.calls()[4..],
            ["close", "open:app", "list_collections:app"]
        );
    }

    #[tokio::test]
    async fn failed_switch_leaves_tree_unchanged_and_restores_session() {
        let mut backend = standard_backend();
        backend.refused_databases.insert("app");
        let (mut controller, backend) = controller(backend, &[profile("1", None)]);
        controller.connect("1").await.expect("connect should succeed");
        let tree_before = controller.tree().clone();

        let err = controller
            .switch_database("1", "app")
            .await
            .expect_err("switch should fail");

        assert!(matches!(err, SessionError::Switch { ref database, .. } if database == "app"));
        assert_eq!(controller.tree(), &tree_before);
        assert_eq!(
            controller.state(),
            &SessionState::Connected {
                profile_id: "1".to_string(),
                database: "postgres".to_string(),
            }
        );
        assert_eq!(backend.opened_databases(), vec!["postgres", "postgres"]);
        let outcome = err.to_outcome(0.1);
        assert!(outcome
            .error()
            .is_some_and(|message| message.contains("does not exist")));
    }

    #[tokio::test]
    async fn failed_close_during_switch_keeps_previous_session() {
        let backend = FakeSessionBackend {
            fail_close: true,
            ..standard_backend()
        };
        let (mut controller, backend) = controller(backend, &[profile("1", None)]);
        controller.connect("1").await.expect("connect should succeed");
        let tree_before = controller.tree().clone();
        let selection_before = controller.selection().clone();

        let err = controller
            .switch_database("1", "app")
            .await
            .expect_err("switch should fail");

        assert!(matches!(err, SessionError::Switch { ref source, .. } if source.message() == "close failed"));
        assert_eq!(controller.tree(), &tree_before);
        assert_eq!(controller.selection(), &selection_before);
        assert_eq!(
            controller.state(),
            &SessionState::Connected {
                profile_id: "1".to_string(),
                database: "postgres".to_string(),
            }
        );
        assert_eq!(backend.opened_databases(), vec!["postgres"]);
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn failed_restore_after_refused_switch_disconnects_without_touching_node() {
        let mut backend = standard_backend();
        backend.refused_databases.insert("app");
        backend.open_limit = Some(1);
        let (mut controller, backend) = controller(backend, &[profile("1", None)]);
        controller.connect("1").await.expect("connect should succeed");
        let node_before = controller.tree().node("1").cloned().expect("node exists");

        let err = controller
            .switch_database("1", "app")
            .await
            .expect_err("switch should fail");

        assert!(matches!(err, SessionError::Switch { ref database, .. } if database == "app"));
        assert_eq!(controller.state(), &SessionState::Disconnected);
        assert!(controller.tree().active_id().is_none());
        assert!(controller.selection().is_empty());

        let node_after = controller.tree().node("1").expect("node exists");
        assert_eq!(node_after.profile.database, node_before.profile.database);
        assert_eq!(node_after.databases, node_before.databases);
        assert_eq!(node_after.expanded, node_before.expanded);
        assert_eq!(
            backend.calls()[4..],
            ["close", "open:app", "open:postgres"]
        );
    }

    #[tokio::test]
    async fn switch_requires_the_active_connection() {
        let (mut controller, _backend) =
            controller(standard_backend(), &[profile("1", None), profile("2", None)]);
        controller.connect("1").await.expect("connect should succeed");

        let err = controller
            .switch_database("2", "app")
            .await
            .expect_err("inactive profile cannot switch");
        assert!(matches!(err, SessionError::NotActive(_)));
    }

    #[tokio::test]
    async fn disconnect_clears_state_even_when_backend_fails() {
        let backend = FakeSessionBackend {
            fail_close: true,
            ..standard_backend()
        };
        let (mut controller, _backend) = controller(backend, &[profile("1", Some("app"))]);
        controller.connect("1").await.expect("connect should succeed");

        controller.disconnect().await;
        controller.disconnect().await;

        assert_eq!(controller.state(), &SessionState::Disconnected);
        assert!(controller.tree().active_id().is_none());
        assert!(controller.selection().is_empty());
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected_without_backend_calls() {
        let (mut controller, backend) = controller(standard_backend(), &[]);
        let err = controller.connect("404").await.expect_err("no such profile");
        assert!(matches!(err, SessionError::UnknownProfile(_)));
        assert!(backend.calls().is_empty());
    }
}
