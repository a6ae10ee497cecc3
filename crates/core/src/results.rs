use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Row key some backends attach for type diagnostics; never shown as a column.
pub const DEBUG_COLUMN: &str = "__debug";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("backend reply is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("backend reply must be an object or an array, got {0}")]
    UnexpectedShape(&'static str),
    #[error("backend reply object is malformed: {0}")]
    Object(#[source] serde_json::Error),
    #[error("result #{index} of a multi-statement reply is malformed: {source}")]
    Element {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// The canonical result handed to renderers. Every dispatch attempt produces
/// a fresh one, success or failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Wall-clock seconds.
    #[serde(default)]
    pub duration: f64,
}

impl QueryResult {
    #[must_use]
    pub fn failure(message: impl Into<String>, duration: f64) -> Self {
        Self {
            error: Some(message.into()),
            duration,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Succeeded without producing rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_error() && self.data.is_empty() && self.total.is_none()
    }

    #[must_use]
    pub fn row_count(&self) -> u64 {
        match self.total {
            Some(total) => u64::try_from(total).unwrap_or_default(),
            None => self.data.len() as u64,
        }
    }

    #[must_use]
    pub fn duration_label(&self) -> String {
        format!("{:.2}s", self.duration)
    }

    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.data {
            let Some(object) = row.as_object() else {
                continue;
            };
            for key in object.keys() {
                if key != DEBUG_COLUMN && !columns.iter().any(|column| column == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

/// One statement's result, or one per statement of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum QueryOutcome {
    Single(QueryResult),
    Multi(Vec<QueryResult>),
}

impl QueryOutcome {
    #[must_use]
    pub fn failure(message: impl Into<String>, duration: f64) -> Self {
        Self::Single(QueryResult::failure(message, duration))
    }

    #[must_use]
    pub fn results(&self) -> &[QueryResult] {
        match self {
            Self::Single(result) => std::slice::from_ref(result),
            Self::Multi(results) => results,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Single(result) => result.error.as_deref(),
            Self::Multi(_) => None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// Sum of the per-result durations, as shown in batch summaries.
    #[must_use]
    pub fn total_duration(&self) -> f64 {
        self.results().iter().map(|result| result.duration).sum()
    }
}

#[derive(Debug, Deserialize)]
struct ReplyObject {
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    total: Option<i64>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    rows_affected: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[must_use]
pub fn elapsed_seconds(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64()
}

/// Converts a raw backend reply into the canonical shape, stamping
/// `duration` on the result. For an array reply every element receives the
/// same total duration.
pub fn normalize(raw: &str, duration: f64) -> Result<QueryOutcome, NormalizeError> {
    let parsed: Value = serde_json::from_str(raw).map_err(NormalizeError::Parse)?;
    match parsed {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let reply: ReplyObject = serde_json::from_value(item)
                    .map_err(|source| NormalizeError::Element { index, source })?;
                Ok(QueryResult {
                    data: reply.data.unwrap_or_default(),
                    total: reply.total,
                    sql: reply.sql,
                    rows_affected: reply.rows_affected,
                    error: reply.error,
                    kind: reply.kind,
                    duration,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(QueryOutcome::Multi),
        Value::Object(object) => {
            let reply: ReplyObject =
                serde_json::from_value(Value::Object(object)).map_err(NormalizeError::Object)?;
            Ok(QueryOutcome::Single(QueryResult {
                data: reply.data.unwrap_or_default(),
                total: reply.total,
                sql: reply.sql,
                rows_affected: reply.rows_affected,
                error: None,
                kind: reply.kind,
                duration,
            }))
        }
        other => Err(NormalizeError::UnexpectedShape(json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
