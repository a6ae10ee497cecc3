use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::SessionBackend;
use crate::connection_tree::{ConnectionTree, SelectionCursor};
use crate::dispatcher::QueryDispatcher;
use crate::loading::LoadingFlag;
use crate::profiles::{ConnectionProfile, NewProfile, ProfileStore, ProfilesError};
use crate::query_templates::TemplateStore;
use crate::results::QueryOutcome;
use crate::session::{SessionController, SessionError, SessionState};
use crate::settings::Settings;
use crate::storage::KeyValueStorage;

/// Everything a renderer needs, detached from the workspace.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceView {
    pub tree: ConnectionTree,
    pub selection: SelectionCursor,
    pub session: SessionState,
    pub loading: bool,
    pub last_result: Option<QueryOutcome>,
}

/// Turns user intents into session, storage and query calls and keeps the
/// most recent result for display.
#[derive(Debug)]
pub struct Workspace<B: SessionBackend + 'static, S: KeyValueStorage> {
    profiles: ProfileStore<S>,
    templates: TemplateStore<S>,
    session: SessionController<B>,
    dispatcher: QueryDispatcher<B>,
    last_result: Option<QueryOutcome>,
}

impl<B, S> Workspace<B, S>
where
    B: SessionBackend + 'static,
    S: KeyValueStorage + Clone,
{
    pub fn new(backend: Arc<B>, storage: S, settings: &Settings) -> Self {
        let profiles = ProfileStore::load(storage.clone());
        let templates = TemplateStore::load(storage);
        let loading = LoadingFlag::new();
        let tree = ConnectionTree::from_profiles(profiles.profiles());
        let session = SessionController::new(Arc::clone(&backend), tree, loading.clone())
            .with_fallback_database(settings.fallback_database().map(str::to_string));
        let dispatcher =
            QueryDispatcher::new(backend, loading).with_timeout(settings.query_timeout());

        Self {
            profiles,
            templates,
            session,
            dispatcher,
            last_result: None,
        }
    }
}

impl<B, S> Workspace<B, S>
where
    B: SessionBackend + 'static,
    S: KeyValueStorage,
{
    #[must_use]
    pub fn profiles(&self) -> &[ConnectionProfile] {
        self.profiles.profiles()
    }

    #[must_use]
    pub fn session(&self) -> &SessionController<B> {
        &self.session
    }

    #[must_use]
    pub fn templates(&self) -> &TemplateStore<S> {
        &self.templates
    }

    pub fn templates_mut(&mut self) -> &mut TemplateStore<S> {
        &mut self.templates
    }

    #[must_use]
    pub fn last_result(&self) -> Option<&QueryOutcome> {
        self.last_result.as_ref()
    }

    #[must_use]
    pub fn view(&self) -> WorkspaceView {
        WorkspaceView {
            tree: self.session.tree().without_secrets(),
            selection: self.session.selection().clone(),
            session: self.session.state().clone(),
            loading: self.session.is_loading(),
            last_result: self.last_result.clone(),
        }
    }

    pub fn request_add_profile(
        &mut self,
        profile: NewProfile,
    ) -> Result<ConnectionProfile, ProfilesError> {
        let profile = self.profiles.add(profile);
        self.session.add_profile(profile.clone());
        self.profiles.save()?;
        info!(id = %profile.id, name = %profile.name, "saved connection profile");
        Ok(profile)
    }

    /// Returns `false` when no profile has this id. Deleting the profile
    /// bearing the live session disconnects it first.
    pub async fn request_delete_profile(&mut self, id: &str) -> Result<bool, ProfilesError> {
        if self.session.tree().is_active(id) {
            self.request_disconnect().await;
        }
        let removed = self.profiles.remove(id);
        self.session.remove_profile(id);
        if removed {
            self.profiles.save()?;
        }
        Ok(removed)
    }

    pub async fn request_connect(&mut self, id: &str) -> Result<(), SessionError> {
        self.last_result = None;
        let connected = self.session.connect(id).await;
        self.record_failure(connected)
    }

    pub async fn request_switch_database(
        &mut self,
        id: &str,
        database: &str,
    ) -> Result<(), SessionError> {
        let switched = self.session.switch_database(id, database).await;
        if switched.is_ok() {
            self.last_result = None;
            self.persist_default_database(id);
        }
        self.record_failure(switched)
    }

    pub async fn request_disconnect(&mut self) {
        self.session.disconnect().await;
        self.last_result = None;
    }

    pub fn request_toggle_expand(&mut self, id: &str) -> bool {
        self.session.toggle_expand(id)
    }

    pub fn request_select(&mut self, database: &str, collection: Option<&str>) {
        self.session.select(database, collection);
        self.last_result = None;
    }

    /// Always leaves a fresh result behind, replacing the previous one.
    pub async fn request_execute(&mut self, raw_text: &str) -> &QueryOutcome {
        let outcome = self
            .dispatcher
            .dispatch(raw_text, self.session.is_connected())
            .await;
        self.last_result.insert(outcome)
    }

    fn record_failure(&mut self, result: Result<(), SessionError>) -> Result<(), SessionError> {
        if let Err(error) = &result {
            warn!(%error, "session request failed");
            self.last_result = Some(error.to_outcome(0.0));
        }
        result
    }

    fn persist_default_database(&mut self, id: &str) {
        let Some(profile) = self.session.tree().node(id).map(|node| node.profile.clone()) else {
            return;
        };
        if self.profiles.update(profile) {
            if let Err(error) = self.profiles.save() {
                warn!(%error, "failed to persist default database");
            }
        }
    }
}
