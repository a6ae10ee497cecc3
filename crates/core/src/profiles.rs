use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{KeyValueStorage, StorageError, PROFILES_KEY};

pub const DEFAULT_PORT: u16 = 3306;

/// A saved connection configuration. Only these fields are ever persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

impl ConnectionProfile {
    /// The configured default database, ignoring blank values.
    #[must_use]
    pub fn configured_database(&self) -> Option<&str> {
        self.database
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Profile fields as entered by the user, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

impl NewProfile {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: String::new(),
            database: None,
        }
    }

    fn with_id(self, id: String) -> ConnectionProfile {
        ConnectionProfile {
            id,
            name: self.name,
            host: self.host,
            port: self.port,
            username: self.username,
            password: self.password,
            database: self.database,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProfilesError {
    #[error("failed to serialize profiles: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist profiles: {0}")]
    Storage(#[from] StorageError),
}

static LAST_ISSUED_ID: AtomicU64 = AtomicU64::new(0);

#[must_use]
pub fn unix_timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Issues a time-derived id that is strictly greater than every id issued
/// before it in this process.
#[must_use]
pub fn next_record_id() -> String {
    let now = unix_timestamp_millis();
    let mut last = LAST_ISSUED_ID.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last.saturating_add(1));
        match LAST_ISSUED_ID.compare_exchange_weak(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return candidate.to_string(),
            Err(actual) => last = actual,
        }
    }
}

pub fn decode_profiles(raw: &str) -> Result<Vec<ConnectionProfile>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
}

pub fn encode_profiles(profiles: &[ConnectionProfile]) -> Result<String, ProfilesError> {
    serde_json::to_string(profiles).map_err(|source| ProfilesError::Serialize { source })
}

#[derive(Debug)]
pub struct ProfileStore<S: KeyValueStorage> {
    storage: S,
    profiles: Vec<ConnectionProfile>,
}

impl<S: KeyValueStorage> ProfileStore<S> {
    /// Loads the persisted list. Unreadable or malformed data is logged and
    /// treated as an empty list.
    pub fn load(storage: S) -> Self {
        let profiles = match storage.read(PROFILES_KEY) {
            Ok(Some(raw)) => decode_profiles(&raw).unwrap_or_else(|error| {
                warn!(%error, "discarding malformed saved connections");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(error) => {
                warn!(%error, "saved connections are unreadable");
                Vec::new()
            }
        };
        debug!(count = profiles.len(), "loaded connection profiles");

        Self { storage, profiles }
    }

    #[must_use]
    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn add(&mut self, profile: NewProfile) -> ConnectionProfile {
        let mut id = next_record_id();
        while self.get(&id).is_some() {
            id = next_record_id();
        }

        let profile = profile.with_id(id);
        self.profiles.push(profile.clone());
        profile
    }

    /// Replaces the profile with the same id; returns `false` when absent.
    pub fn update(&mut self, profile: ConnectionProfile) -> bool {
        match self
            .profiles
            .iter_mut()
            .find(|existing| existing.id == profile.id)
        {
            Some(existing) => {
                *existing = profile;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let original_len = self.profiles.len();
        self.profiles.retain(|profile| profile.id != id);
        self.profiles.len() != original_len
    }

    pub fn save(&self) -> Result<(), ProfilesError> {
        let rendered = encode_profiles(&self.profiles)?;
        self.storage.write(PROFILES_KEY, &rendered)?;
        Ok(())
    }
}
