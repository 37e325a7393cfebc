use std::time::Duration;

use serde::Serialize;
use sqlx::{Column, Connection, Row};
use uuid::Uuid;

use super::guard::{self, QueryGuardError};
use super::store::{DatabaseInstance, QuerySessionRecord, insert_query_session};
use crate::audit::{AuditEntry, Subsystem};
use crate::error::ApiError;
use crate::secrets::engine;
use crate::store::{AppState, now_ms};

#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: i64,
    pub rows_affected: Option<u64>,
    pub truncated: bool,
    pub duration_ms: i64,
    pub status: String,
}

#[derive(Debug, thiserror::Error)]
enum ExecError {
    #[error("query timed out")]
    Timeout,
    #[error("{0}")]
    Driver(String),
}

/// Run a validated query against a managed instance: guard check, audit,
/// bounded connection slot, per-request deadline, result-size cap, and an
/// append-only `QuerySession` row whatever the outcome.
#[tracing::instrument(
    skip(state, instance, query),
    fields(instance_id = %instance.id, executed_by = %operator),
    err
)]
pub async fn run_query(
    state: &AppState,
    instance: &DatabaseInstance,
    database: &str,
    query: &str,
    operator: &str,
    client_ip: Option<&str>,
) -> Result<QueryResult, ApiError> {
    let audit_base = || {
        AuditEntry::new(Subsystem::Database, operator, "query")
            .resource("instance", &instance.name)
            .instance(&instance.id)
            .client_ip(client_ip)
            .details(serde_json::json!({ "database": database }))
    };

    // Fail closed: a rejected query never reaches the driver, and the
    // attempt itself is audited.
    if let Err(guard_err) = validate(instance, query) {
        state.metrics.queries_rejected_total.inc();
        state
            .audit
            .emit(audit_base().failed(&guard_err.to_string()))
            .await;
        return Err(ApiError::QueryRejected(guard_err));
    }

    let Some(_permit) = state
        .conn_guard
        .acquire(Duration::from_secs(state.config.query.timeout_secs))
        .await
    else {
        return Err(ApiError::Unavailable("query connection limit reached".into()));
    };

    let password = engine::decrypt_string(&instance.password_cipher, &state.master_key)?;
    let timeout = Duration::from_secs(state.config.query.timeout_secs);
    let max_rows = state.config.query.max_rows;

    let started_at = now_ms();
    let outcome = match instance.db_type.as_str() {
        "redis" => {
            let url = redis_url(instance, &password, database);
            execute_redis(&url, query, timeout).await
        }
        _ => {
            let url = sql_url(instance, &password, database);
            execute_sql(&url, query, timeout, max_rows).await
        }
    };
    let completed_at = now_ms();
    let duration_ms = completed_at - started_at;

    let (result, audit_entry) = match outcome {
        Ok(mut result) => {
            result.duration_ms = duration_ms;
            state.metrics.queries_executed_total.inc();
            let entry = audit_base().details(serde_json::json!({
                "database": database,
                "rows": result.row_count,
                "status": result.status,
            }));
            (Ok(result), entry)
        }
        Err(ExecError::Timeout) => {
            let entry = audit_base().failed("query timed out");
            (Err(ApiError::Timeout), entry)
        }
        Err(ExecError::Driver(msg)) => {
            let entry = audit_base().failed(&msg);
            (Err(ApiError::BadRequest(msg)), entry)
        }
    };

    let (status, row_count, bytes_returned, error_message) = match &result {
        Ok(r) => (
            r.status.clone(),
            r.row_count,
            estimate_bytes(r),
            None,
        ),
        Err(ApiError::Timeout) => ("timeout".to_owned(), 0, 0, Some("query timed out".into())),
        Err(e) => ("error".to_owned(), 0, 0, Some(e.to_string())),
    };

    let record = QuerySessionRecord {
        id: Uuid::new_v4().to_string(),
        instance_id: instance.id.clone(),
        executed_by: operator.to_owned(),
        database_name: database.to_owned(),
        query_text: query.to_owned(),
        query_type: guard::query_type(query),
        started_at,
        completed_at: Some(completed_at),
        duration_ms,
        row_count,
        bytes_returned,
        status,
        error_message,
        client_ip: client_ip.map(ToOwned::to_owned),
    };
    if let Err(e) = insert_query_session(&state.db, &record).await {
        tracing::error!(error = %e, "failed to record query session");
    }

    state.audit.emit(audit_entry).await;
    result
}

fn validate(instance: &DatabaseInstance, query: &str) -> Result<(), QueryGuardError> {
    if instance.db_type == "redis" {
        return guard::validate_redis(query);
    }
    if guard::statement_count(query) > 1 {
        return Err(QueryGuardError::MultipleStatements);
    }
    match guard::validate_sql(query) {
        // The tautology detector is advisory; instances can opt out of it.
        Err(QueryGuardError::InjectionPattern(ref msg))
            if msg == "boolean tautology" && instance.allow_risky_filters =>
        {
            tracing::warn!(instance = %instance.name, "tautology check bypassed by instance flag");
            Ok(())
        }
        other => other,
    }
}

fn sql_url(instance: &DatabaseInstance, password: &str, database: &str) -> String {
    let scheme = match instance.db_type.as_str() {
        "mysql" => "mysql",
        _ => "postgres",
    };
    let mut url = format!(
        "{scheme}://{}:{}@{}:{}/{}",
        instance.username, password, instance.host, instance.port, database
    );
    if scheme == "postgres" && !instance.ssl_mode.is_empty() {
        url.push_str(&format!("?sslmode={}", instance.ssl_mode));
    }
    url
}

fn redis_url(instance: &DatabaseInstance, password: &str, database: &str) -> String {
    let db_index = if database.is_empty() { "0" } else { database };
    if password.is_empty() {
        format!("redis://{}:{}/{}", instance.host, instance.port, db_index)
    } else {
        format!(
            "redis://{}:{}@{}:{}/{}",
            instance.username, password, instance.host, instance.port, db_index
        )
    }
}

/// Execute one SQL statement over a single-use `Any` connection. The whole
/// operation (dial + query) shares the deadline; on expiry the future is
/// dropped, which tears down the connection and cancels server-side work.
async fn execute_sql(
    url: &str,
    query: &str,
    deadline: Duration,
    max_rows: usize,
) -> Result<QueryResult, ExecError> {
    crate::store::pool::ensure_drivers();
    let fut = async {
        let mut conn = sqlx::AnyConnection::connect(url)
            .await
            .map_err(|e| ExecError::Driver(sanitize(&e)))?;

        let result = if is_row_returning(query) {
            let rows = sqlx::query(query)
                .fetch_all(&mut conn)
                .await
                .map_err(|e| ExecError::Driver(sanitize(&e)))?;
            rows_to_result(&rows, max_rows)
        } else {
            let done = sqlx::query(query)
                .execute(&mut conn)
                .await
                .map_err(|e| ExecError::Driver(sanitize(&e)))?;
            QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                row_count: 0,
                rows_affected: Some(done.rows_affected()),
                truncated: false,
                duration_ms: 0,
                status: "success".into(),
            }
        };

        let _ = conn.close().await;
        Ok(result)
    };

    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout),
    }
}

fn is_row_returning(query: &str) -> bool {
    matches!(
        guard::query_type(query).as_str(),
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "WITH"
    )
}

fn rows_to_result(rows: &[sqlx::any::AnyRow], max_rows: usize) -> QueryResult {
    let columns: Vec<String> = rows.first().map_or_else(Vec::new, |row| {
        row.columns().iter().map(|c| c.name().to_owned()).collect()
    });

    let truncated = rows.len() > max_rows;
    let mut out = Vec::with_capacity(rows.len().min(max_rows));
    for row in rows.iter().take(max_rows) {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(decode_value(row, i));
        }
        out.push(values);
    }

    QueryResult {
        row_count: i64::try_from(out.len()).unwrap_or(i64::MAX),
        columns,
        rows: out,
        rows_affected: None,
        truncated,
        duration_ms: 0,
        status: if truncated { "truncated" } else { "success" }.into(),
    }
}

/// Best-effort scalar decoding across backends: integers, floats, booleans,
/// text; anything else renders as null.
fn decode_value(row: &sqlx::any::AnyRow, index: usize) -> serde_json::Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(serde_json::Value::Null, Into::into);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(|f| serde_json::Number::from_f64(f).map(serde_json::Value::Number))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(serde_json::Value::Null, Into::into);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(serde_json::Value::Null, Into::into);
    }
    serde_json::Value::Null
}

async fn execute_redis(
    url: &str,
    command: &str,
    deadline: Duration,
) -> Result<QueryResult, ExecError> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some((first, rest)) = tokens.split_first() else {
        return Err(ExecError::Driver("empty command".into()));
    };

    let fut = async {
        let client =
            redis::Client::open(url).map_err(|e| ExecError::Driver(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ExecError::Driver(e.to_string()))?;

        let mut cmd = redis::cmd(first);
        for arg in rest {
            cmd.arg(*arg);
        }
        let value: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| ExecError::Driver(e.to_string()))?;
        Ok(redis_value_to_json(&value))
    };

    let json = match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result?,
        Err(_) => return Err(ExecError::Timeout),
    };

    let row_count = match &json {
        serde_json::Value::Array(items) => i64::try_from(items.len()).unwrap_or(i64::MAX),
        serde_json::Value::Null => 0,
        _ => 1,
    };
    Ok(QueryResult {
        columns: vec!["result".into()],
        rows: vec![vec![json]],
        row_count,
        rows_affected: None,
        truncated: false,
        duration_ms: 0,
        status: "success".into(),
    })
}

fn redis_value_to_json(value: &redis::Value) -> serde_json::Value {
    match value {
        redis::Value::Nil => serde_json::Value::Null,
        redis::Value::Int(i) => (*i).into(),
        redis::Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
        redis::Value::Bulk(items) => {
            serde_json::Value::Array(items.iter().map(redis_value_to_json).collect())
        }
        redis::Value::Status(s) => s.clone().into(),
        redis::Value::Okay => "OK".into(),
    }
}

/// Driver errors go back to the operator, minus anything that could leak
/// credentials embedded in connection URLs.
fn sanitize(err: &sqlx::Error) -> String {
    let msg = err.to_string();
    if msg.contains("://") {
        "driver connection error".to_owned()
    } else {
        msg
    }
}

fn estimate_bytes(result: &QueryResult) -> i64 {
    serde_json::to_string(&result.rows)
        .map(|s| i64::try_from(s.len()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(db_type: &str, risky: bool) -> DatabaseInstance {
        DatabaseInstance {
            id: "i1".into(),
            name: "test".into(),
            db_type: db_type.into(),
            host: "localhost".into(),
            port: 5432,
            username: "u".into(),
            password_cipher: String::new(),
            ssl_mode: "disable".into(),
            allow_risky_filters: risky,
            status: "unknown".into(),
            last_check_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn multiple_statements_rejected_at_execution() {
        let inst = instance("postgresql", false);
        assert_eq!(
            validate(&inst, "SELECT 1; SELECT 2"),
            Err(QueryGuardError::MultipleStatements)
        );
    }

    #[test]
    fn tautology_bypass_honors_instance_flag() {
        let query = "SELECT * FROM t WHERE 1=1 OR 1=1";
        assert!(validate(&instance("postgresql", false), query).is_err());
        assert!(validate(&instance("postgresql", true), query).is_ok());
    }

    #[test]
    fn bypass_does_not_cover_other_patterns() {
        let inst = instance("postgresql", true);
        assert!(validate(&inst, "SELECT SLEEP(5)").is_err());
        assert!(validate(&inst, "DROP TABLE t").is_err());
    }

    #[test]
    fn redis_instances_use_redis_rules() {
        let inst = instance("redis", false);
        assert!(validate(&inst, "GET foo").is_ok());
        assert!(validate(&inst, "FLUSHALL").is_err());
    }

    #[test]
    fn row_returning_detection() {
        assert!(is_row_returning("SELECT 1"));
        assert!(is_row_returning("  show tables"));
        assert!(!is_row_returning("INSERT INTO t VALUES (1)"));
        assert!(!is_row_returning("UPDATE t SET a=1 WHERE b=2"));
    }

    #[tokio::test]
    async fn executes_select_against_sqlite() {
        let result = execute_sql(
            "sqlite::memory:",
            "SELECT 1 AS one, 'two' AS two",
            Duration::from_secs(5),
            100,
        )
        .await
        .unwrap();
        assert_eq!(result.columns, vec!["one", "two"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], serde_json::json!(1));
        assert_eq!(result.rows[0][1], serde_json::json!("two"));
        assert_eq!(result.status, "success");
    }

    #[tokio::test]
    async fn truncates_large_results() {
        let query = "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 10) SELECT n FROM seq";
        let result = execute_sql("sqlite::memory:", query, Duration::from_secs(5), 3)
            .await
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.status, "truncated");
    }

    #[tokio::test]
    async fn driver_error_surfaces() {
        let err = execute_sql(
            "sqlite::memory:",
            "SELECT * FROM missing_table",
            Duration::from_secs(5),
            10,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Driver(_)));
    }
}
