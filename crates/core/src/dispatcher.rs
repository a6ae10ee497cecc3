use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{BackendError, QueryPayload, SessionBackend};
use crate::loading::LoadingFlag;
use crate::results::{elapsed_seconds, normalize, NormalizeError, QueryOutcome};
use crate::settings::DEFAULT_QUERY_TIMEOUT_SECS;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS);

const SQL_KEYWORDS: [&str; 7] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Sql,
    Structured,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("not connected to a database; connect first")]
    NotConnected,
    #[error("invalid structured query: {0}")]
    Classification(#[source] serde_json::Error),
    #[error("structured query must be a JSON object")]
    NotAnObject,
    #[error("query timed out: no reply within {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Backend(#[source] BackendError),
    #[error("query task ended abnormally: {0}")]
    Task(String),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

#[must_use]
pub fn classify(raw_text: &str) -> QueryKind {
    let upper = raw_text.trim().to_uppercase();
    if SQL_KEYWORDS.iter().any(|keyword| upper.starts_with(keyword)) {
        QueryKind::Sql
    } else {
        QueryKind::Structured
    }
}

pub fn build_payload(raw_text: &str) -> Result<QueryPayload, DispatchError> {
    match classify(raw_text) {
        QueryKind::Sql => Ok(QueryPayload::sql(raw_text.trim())),
        QueryKind::Structured => {
            let value: serde_json::Value =
                serde_json::from_str(raw_text).map_err(DispatchError::Classification)?;
            match value {
                serde_json::Value::Object(map) => Ok(QueryPayload::Structured(map)),
                _ => Err(DispatchError::NotAnObject),
            }
        }
    }
}

/// Sends one query to the backend and turns whatever comes back, including
/// failures and timeouts, into a renderable [`QueryOutcome`].
#[derive(Debug)]
pub struct QueryDispatcher<B: SessionBackend + 'static> {
    backend: Arc<B>,
    timeout: Duration,
    loading: LoadingFlag,
}

impl<B: SessionBackend + 'static> QueryDispatcher<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, loading: LoadingFlag) -> Self {
        Self {
            backend,
            timeout: QUERY_TIMEOUT,
            loading,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn dispatch(&self, raw_text: &str, connected: bool) -> QueryOutcome {
        if !connected {
            return QueryOutcome::failure(DispatchError::NotConnected.to_string(), 0.0);
        }

        let payload = match build_payload(raw_text) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "rejected query before dispatch");
                return QueryOutcome::failure(error.to_string(), 0.0);
            }
        };
        debug!(payload = %payload.to_value(), "dispatching query");

        let _busy = self.loading.begin();
        let started_at = Instant::now();
        let reply = self.race(payload).await;
        let duration = elapsed_seconds(started_at.elapsed());

        let outcome = reply.and_then(|raw| normalize(&raw, duration).map_err(DispatchError::from));
        match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%error, duration, "query failed");
                QueryOutcome::failure(error.to_string(), duration)
            }
        }
    }

    /// First to settle wins. The backend call runs on its own task so a
    /// timeout only stops the wait; the call itself keeps running.
    async fn race(&self, payload: QueryPayload) -> Result<String, DispatchError> {
        let backend = Arc::clone(&self.backend);
        let call = tokio::spawn(async move { backend.execute_query(payload).await });

        tokio::select! {
            joined = call => match joined {
                Ok(reply) => reply.map_err(DispatchError::Backend),
                Err(error) => Err(DispatchError::Task(error.to_string())),
            },
            () = tokio::time::sleep(self.timeout) => Err(DispatchError::Timeout(self.timeout)),
        }
    }
}
