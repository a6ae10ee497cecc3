use async_trait::async_trait;
use dbdeck_core::backend::{BackendError, QueryPayload, SessionBackend, SessionConfig};
use dbdeck_core::structured_query::{Operation, StructuredQuery};
use futures_util::lock::Mutex;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Row, Value};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

/// Every account can open this schema, so it backs sessions for profiles
/// without a configured database.
pub const ADMINISTRATIVE_DATABASE: &str = "information_schema";
pub const PASSWORD_ENV_VAR: &str = "DBDECK_DB_PASSWORD";
const KEYRING_SERVICE: &str = "dbdeck";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Write,
    Ddl,
}

impl StatementKind {
    #[must_use]
    pub fn classify(statement: &str) -> Self {
        let keyword = statement
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "WITH" => Self::Select,
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => Self::Write,
            _ => Self::Ddl,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Write => "write",
            Self::Ddl => "ddl",
        }
    }
}

/// Splits on `;`, trimming and dropping empty statements. Semicolons inside
/// string literals are not recognized.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Holds the one open session. Calls made while no session is open fail.
#[derive(Debug, Default)]
pub struct MysqlSessionBackend {
    session: Mutex<Option<Conn>>,
}

impl MysqlSessionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_statement(
        conn: &mut Conn,
        statement: &str,
    ) -> Result<JsonValue, mysql_async::Error> {
        let kind = StatementKind::classify(statement);
        debug!(kind = kind.as_str(), %statement, "running statement");
        match kind {
            StatementKind::Select => {
                let rows: Vec<Row> = conn.query(statement).await?;
                let data = rows.into_iter().map(row_to_json).collect::<Vec<_>>();
                Ok(json!({
                    "type": kind.as_str(),
                    "sql": statement,
                    "rows_affected": data.len(),
                    "data": data,
                }))
            }
            StatementKind::Write | StatementKind::Ddl => {
                conn.query_drop(statement).await?;
                Ok(json!({
                    "type": kind.as_str(),
                    "sql": statement,
                    "rows_affected": conn.affected_rows(),
                }))
            }
        }
    }

    async fn execute_sql(conn: &mut Conn, sql: &str) -> Result<String, BackendError> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return Err(BackendError::new("no executable SQL statements"));
        }

        let mut replies = Vec::with_capacity(statements.len());
        for statement in &statements {
            let reply = Self::run_statement(conn, statement)
                .await
                .map_err(to_backend_error)?;
            replies.push(reply);
        }
        Ok(combine_replies(replies).to_string())
    }

    async fn execute_structured(
        conn: &mut Conn,
        payload: &Map<String, JsonValue>,
    ) -> Result<String, BackendError> {
        let query = StructuredQuery::from_payload(payload)
            .map_err(|error| BackendError::new(error.to_string()))?;
        let bound = query
            .to_sql()
            .map_err(|error| BackendError::new(error.to_string()))?;
        debug!(
            operation = query.operation.as_str(),
            sql = %bound.sql,
            params = bound.params.len(),
            "running structured query"
        );
        let params = Params::from(
            bound
                .params
                .iter()
                .map(json_to_mysql_value)
                .collect::<Vec<_>>(),
        );

        let reply = match query.operation {
            Operation::Find | Operation::FindOne => {
                let rows: Vec<Row> = conn
                    .exec(bound.sql, params)
                    .await
                    .map_err(to_backend_error)?;
                let data = rows.into_iter().map(row_to_json).collect::<Vec<_>>();
                json!({ "data": data })
            }
            Operation::Count => {
                let total: Option<i64> = conn
                    .exec_first(bound.sql, params)
                    .await
                    .map_err(to_backend_error)?;
                json!({ "data": [], "total": total.unwrap_or_default() })
            }
        };
        Ok(reply.to_string())
    }
}

#[async_trait]
impl SessionBackend for MysqlSessionBackend {
    fn administrative_database(&self) -> &str {
        ADMINISTRATIVE_DATABASE
    }

    async fn open_session(&self, config: &SessionConfig) -> Result<bool, BackendError> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            if let Err(error) = previous.disconnect().await {
                warn!(%error, "failed to close replaced session");
            }
        }

        let conn = Conn::new(opts_from_config(config))
            .await
            .map_err(to_backend_error)?;
        *session = Some(conn);
        Ok(true)
    }

    async fn close_session(&self) -> Result<(), BackendError> {
        let conn = self.session.lock().await.take();
        match conn {
            Some(conn) => conn.disconnect().await.map_err(to_backend_error),
            None => Ok(()),
        }
    }

    async fn list_databases(&self) -> Result<String, BackendError> {
        let mut session = self.session.lock().await;
        let conn = session.as_mut().ok_or_else(not_connected)?;
        let databases: Vec<String> = conn
            .query("SHOW DATABASES")
            .await
            .map_err(to_backend_error)?;
        Ok(json!({ "databases": databases }).to_string())
    }

    async fn list_collections(&self, database: &str) -> Result<String, BackendError> {
        let mut session = self.session.lock().await;
        let conn = session.as_mut().ok_or_else(not_connected)?;
        let collections = conn
            .exec_map(
                "SELECT TABLE_NAME \
                 FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? \
                 ORDER BY TABLE_NAME",
                (database.to_string(),),
                |table_name: String| table_name,
            )
            .await
            .map_err(to_backend_error)?;
        Ok(json!({ "collections": collections }).to_string())
    }

    async fn execute_query(&self, payload: QueryPayload) -> Result<String, BackendError> {
        let mut session = self.session.lock().await;
        let conn = session.as_mut().ok_or_else(not_connected)?;
        match &payload {
            QueryPayload::Sql { sql } => Self::execute_sql(conn, sql).await,
            QueryPayload::Structured(map) => match map.get("sql").and_then(JsonValue::as_str) {
                Some(sql) => Self::execute_sql(conn, sql).await,
                None => Self::execute_structured(conn, map).await,
            },
        }
    }
}

/// One reply stays an object; a batch becomes an array.
fn combine_replies(mut replies: Vec<JsonValue>) -> JsonValue {
    if replies.len() == 1 {
        replies.remove(0)
    } else {
        JsonValue::Array(replies)
    }
}

fn opts_from_config(config: &SessionConfig) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.username.clone()))
        .db_name(Some(config.database.clone()));

    if let Some(password) = resolve_password(config) {
        builder = builder.pass(Some(password));
    }

    builder
}

/// The profile's own password wins, then the OS keyring, then the
/// environment. A password taken from the environment is remembered in the
/// keyring.
fn resolve_password(config: &SessionConfig) -> Option<String> {
    if !config.password.is_empty() {
        return Some(config.password.clone());
    }
    if let Some(password) = load_keyring_password(config) {
        return Some(password);
    }

    let env_password = std::env::var(PASSWORD_ENV_VAR)
        .ok()
        .filter(|password| !password.is_empty())?;
    store_keyring_password(config, &env_password);
    Some(env_password)
}

fn keyring_account(config: &SessionConfig) -> String {
    format!("{}@{}:{}", config.username, config.host, config.port)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(config: &SessionConfig) -> Option<String> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &keyring_account(config)).ok()?;
    entry.get_password().ok().filter(|password| !password.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_config: &SessionConfig) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(config: &SessionConfig, password: &str) {
    match keyring::Entry::new(KEYRING_SERVICE, &keyring_account(config)) {
        Ok(entry) => {
            if let Err(error) = entry.set_password(password) {
                debug!(%error, "could not remember password in keyring");
            }
        }
        Err(error) => debug!(%error, "keyring unavailable"),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_config: &SessionConfig, _password: &str) {}

fn row_to_json(row: Row) -> JsonValue {
    let columns = row.columns();
    let values = row.unwrap();
    let mut object = Map::with_capacity(values.len());
    for (column, value) in columns.iter().zip(values) {
        object.insert(column.name_str().into_owned(), mysql_value_to_json(value));
    }
    JsonValue::Object(object)
}

fn mysql_value_to_json(value: Value) -> JsonValue {
    match value {
        Value::NULL => JsonValue::Null,
        Value::Bytes(bytes) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(value) => JsonValue::from(value),
        Value::UInt(value) => JsonValue::from(value),
        Value::Float(value) => JsonValue::from(f64::from(value)),
        Value::Double(value) => JsonValue::from(value),
        Value::Date(year, month, day, hour, minute, second, micros) => JsonValue::String(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        )),
        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            JsonValue::String(format!(
                "{sign}{days:03} {hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

/// Filter values are bound as statement parameters, never spliced into SQL.
fn json_to_mysql_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Bool(flag) => Value::Int(i64::from(*flag)),
        JsonValue::Number(number) => {
            if let Some(int) = number.as_i64() {
                Value::Int(int)
            } else if let Some(uint) = number.as_u64() {
                Value::UInt(uint)
            } else {
                Value::Double(number.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(text) => Value::Bytes(text.as_bytes().to_vec()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => Value::NULL,
    }
}

fn not_connected() -> BackendError {
    BackendError::new("no open session")
}

fn to_backend_error(error: mysql_async::Error) -> BackendError {
    BackendError::new(error.to_string())
}

#[cfg(test)]
mod tests {
    use dbdeck_core::backend::{SessionBackend, SessionConfig};
    use mysql_async::Value;
    use serde_json::json;

    use super::{
        combine_replies, json_to_mysql_value, keyring_account, mysql_value_to_json,
        opts_from_config, resolve_password, split_statements, MysqlSessionBackend, StatementKind,
        ADMINISTRATIVE_DATABASE,
    };

    fn config(password: &str) -> SessionConfig {
        SessionConfig {
            host: "127.0.0.1".to_string(),
            port: 3307,
            username: "root".to_string(),
            password: password.to_string(),
            database: "app".to_string(),
        }
    }

    #[test]
    fn splits_on_semicolons_and_drops_empty_statements() {
        assert_eq!(
            split_statements(" SELECT 1; ;\nUPDATE t SET a = 1;  "),
            vec!["SELECT 1", "UPDATE t SET a = 1"]
        );
        assert!(split_statements(" ;; \n").is_empty());
    }

    #[test]
    fn classifies_statements_by_leading_keyword() {
        assert_eq!(StatementKind::classify("select 1"), StatementKind::Select);
        assert_eq!(StatementKind::classify("SHOW TABLES"), StatementKind::Select);
        assert_eq!(
            StatementKind::classify("with x as (select 1) select * from x"),
            StatementKind::Select
        );
        assert_eq!(StatementKind::classify("delete from t"), StatementKind::Write);
        assert_eq!(StatementKind::classify("CREATE TABLE t (id INT)"), StatementKind::Ddl);
        assert_eq!(StatementKind::classify(""), StatementKind::Ddl);
    }

    #[test]
    fn single_reply_stays_an_object_and_batches_become_arrays() {
        let one = combine_replies(vec![json!({"type": "ddl"})]);
        assert!(one.is_object());

        let many = combine_replies(vec![json!({"type": "select"}), json!({"type": "write"})]);
        assert_eq!(many.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn values_convert_to_json() {
        assert_eq!(mysql_value_to_json(Value::NULL), json!(null));
        assert_eq!(mysql_value_to_json(Value::Bytes(b"hello".to_vec())), json!("hello"));
        assert_eq!(mysql_value_to_json(Value::Int(-8)), json!(-8));
        assert_eq!(mysql_value_to_json(Value::UInt(8)), json!(8));
        assert_eq!(
            mysql_value_to_json(Value::Date(2024, 1, 2, 3, 4, 5, 6)),
            json!("2024-01-02 03:04:05.000006")
        );
    }

    #[test]
    fn filter_params_bind_as_typed_values() {
        assert_eq!(json_to_mysql_value(&json!(null)), Value::NULL);
        assert_eq!(json_to_mysql_value(&json!(true)), Value::Int(1));
        assert_eq!(json_to_mysql_value(&json!(-3)), Value::Int(-3));
        assert_eq!(json_to_mysql_value(&json!(u64::MAX)), Value::UInt(u64::MAX));
        assert_eq!(json_to_mysql_value(&json!(1.5)), Value::Double(1.5));
        assert_eq!(
            json_to_mysql_value(&json!("C:\\")),
            Value::Bytes(b"C:\\".to_vec())
        );
    }

    #[test]
    fn explicit_password_wins_and_options_build() {
        let config = config("secret");
        assert_eq!(resolve_password(&config).as_deref(), Some("secret"));
        assert_eq!(keyring_account(&config), "root@127.0.0.1:3307");
        let _opts = opts_from_config(&config);
    }

    #[tokio::test]
    async fn calls_without_session_fail_and_close_is_idempotent() {
        let backend = MysqlSessionBackend::new();
        assert_eq!(backend.administrative_database(), ADMINISTRATIVE_DATABASE);
        assert!(backend.close_session().await.is_ok());
        assert!(backend.close_session().await.is_ok());

        let err = backend
            .list_databases()
            .await
            .expect_err("no session is open");
        assert_eq!(err.message(), "no open session");
    }
}
