use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profiles::ConnectionProfile;

pub const DEFAULT_ADMINISTRATIVE_DATABASE: &str = "postgres";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Everything the backend needs to open a session bound to one database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl SessionConfig {
    #[must_use]
    pub fn for_profile(profile: &ConnectionProfile, database: &str) -> Self {
        Self {
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            password: profile.password.clone(),
            database: database.to_string(),
        }
    }
}

/// The body sent to `execute_query`: raw SQL text or a structured
/// operation object passed through as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum QueryPayload {
    Sql { sql: String },
    Structured(serde_json::Map<String, serde_json::Value>),
}

impl QueryPayload {
    #[must_use]
    pub fn sql(text: impl Into<String>) -> Self {
        Self::Sql { sql: text.into() }
    }

    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Sql { sql } => serde_json::json!({ "sql": sql }),
            Self::Structured(map) => serde_json::Value::Object(map.clone()),
        }
    }
}

/// The single-session command interface of a database backend. Replies are
/// JSON-encoded strings; the backend holds at most one open session.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Database opened when neither the profile nor the settings name one.
    fn administrative_database(&self) -> &str {
        DEFAULT_ADMINISTRATIVE_DATABASE
    }

    async fn open_session(&self, config: &SessionConfig) -> Result<bool, BackendError>;

    /// Closing without an open session must succeed.
    async fn close_session(&self) -> Result<(), BackendError>;

    /// `{"databases": [name, ...]}`
    async fn list_databases(&self) -> Result<String, BackendError>;

    /// `{"collections": [name, ...]}`, names possibly `schema.table`.
    async fn list_collections(&self, database: &str) -> Result<String, BackendError>;

    /// A single result object or an array of result objects.
    async fn execute_query(&self, payload: QueryPayload) -> Result<String, BackendError>;
}

#[derive(Debug, Deserialize)]
struct DatabaseListReply {
    databases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CollectionListReply {
    collections: Vec<String>,
}

pub fn parse_database_list(raw: &str) -> Result<Vec<String>, BackendError> {
    serde_json::from_str::<DatabaseListReply>(raw)
        .map(|reply| reply.databases)
        .map_err(|error| BackendError::new(format!("malformed database list: {error}")))
}

pub fn parse_collection_list(raw: &str) -> Result<Vec<String>, BackendError> {
    serde_json::from_str::<CollectionListReply>(raw)
        .map(|reply| reply.collections)
        .map_err(|error| BackendError::new(format!("malformed collection list: {error}")))
}

#[cfg(test)]
mod tests {
    use super::{parse_collection_list, parse_database_list, QueryPayload};

    #[test]
    fn parses_list_envelopes() {
        assert_eq!(
            parse_database_list(r#"{"databases":["postgres","app"]}"#).expect("valid list"),
            vec!["postgres", "app"]
        );
        assert_eq!(
            parse_collection_list(r#"{"collections":["public.users"]}"#).expect("valid list"),
            vec!["public.users"]
        );
    }

    #[test]
    fn rejects_envelopes_with_the_wrong_key() {
        let err = parse_database_list(r#"{"collections":[]}"#).expect_err("wrong key");
        assert!(err.message().starts_with("malformed database list"));
    }

    #[test]
    fn payload_serializes_to_wire_shape() {
        let sql = QueryPayload::sql("SELECT 1");
        assert_eq!(
            serde_json::to_value(&sql).expect("serializable"),
            serde_json::json!({ "sql": "SELECT 1" })
        );

        let structured: QueryPayload =
            serde_json::from_str(r#"{"table":"users","operation":"count"}"#).expect("valid");
        assert!(matches!(structured, QueryPayload::Structured(_)));
        assert_eq!(
            structured.to_value(),
            serde_json::json!({ "table": "users", "operation": "count" })
        );
    }
}
