use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::store::now_ms;
use crate::store::pool::Db;

/// Row clamps: terminals below 10x40 or above 200x300 are almost always a
/// corrupt client resize; the stored geometry stays inside these bounds.
pub const MIN_ROWS: i64 = 10;
pub const MAX_ROWS: i64 = 200;
pub const MIN_COLS: i64 = 40;
pub const MAX_COLS: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct RecordingRow {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub recording_type: String,
    pub type_metadata: serde_json::Value,
    pub storage_type: String,
    pub storage_path: String,
    pub format: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub duration_seconds: i64,
    pub file_size_bytes: i64,
    pub rows: i64,
    pub cols: i64,
    pub shell: String,
    pub client_ip: Option<String>,
    pub tags: Vec<String>,
}

pub struct NewRecording<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub username: &'a str,
    /// One of `docker`, `webssh`, `k8s_node`, `k8s_pod`.
    pub recording_type: &'a str,
    pub type_metadata: serde_json::Value,
    pub storage_type: &'a str,
    pub storage_path: &'a str,
    pub rows: i64,
    pub cols: i64,
    pub shell: &'a str,
    pub client_ip: Option<&'a str>,
    pub tags: &'a [String],
}

fn row_to_recording(row: &sqlx::any::AnyRow) -> Result<RecordingRow, sqlx::Error> {
    let metadata_raw: String = row.try_get("type_metadata")?;
    let tags_raw: String = row.try_get("tags")?;
    Ok(RecordingRow {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        recording_type: row.try_get("recording_type")?,
        type_metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        storage_type: row.try_get("storage_type")?,
        storage_path: row.try_get("storage_path")?,
        format: row.try_get("format")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        rows: row.try_get("term_rows")?,
        cols: row.try_get("term_cols")?,
        shell: row.try_get("shell")?,
        client_ip: row.try_get("client_ip")?,
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
    })
}

const RECORDING_COLUMNS: &str = "id, session_id, user_id, username, recording_type, type_metadata, \
     storage_type, storage_path, format, started_at, ended_at, duration_seconds, \
     file_size_bytes, term_rows, term_cols, shell, client_ip, tags";

/// Create the row at session open. Geometry is clamped into the valid range.
/// Returns the recording id (also the cast file stem).
pub async fn create(db: &Db, new: &NewRecording<'_>) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(&db.sql(
        "INSERT INTO terminal_recordings
            (id, session_id, user_id, username, recording_type, type_metadata,
             storage_type, storage_path, format, started_at, duration_seconds,
             file_size_bytes, term_rows, term_cols, shell, client_ip, tags)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, 0, $11, $12, $13, $14, $15)",
    ))
    .bind(&id)
    .bind(new.session_id)
    .bind(new.user_id)
    .bind(new.username)
    .bind(new.recording_type)
    .bind(new.type_metadata.to_string())
    .bind(new.storage_type)
    .bind(new.storage_path)
    .bind("asciinema_v2")
    .bind(now_ms())
    .bind(new.rows.clamp(MIN_ROWS, MAX_ROWS))
    .bind(new.cols.clamp(MIN_COLS, MAX_COLS))
    .bind(new.shell)
    .bind(new.client_ip)
    .bind(serde_json::to_string(new.tags)?)
    .execute(&db.pool)
    .await?;
    Ok(id)
}

/// Close the row at session end. `ended_at` never precedes `started_at`.
pub async fn finish(
    db: &Db,
    id: &str,
    duration_seconds: i64,
    file_size_bytes: i64,
) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "UPDATE terminal_recordings
         SET ended_at = $1, duration_seconds = $2, file_size_bytes = $3
         WHERE id = $4",
    ))
    .bind(now_ms())
    .bind(duration_seconds.max(0))
    .bind(file_size_bytes.max(0))
    .bind(id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn get(db: &Db, id: &str) -> anyhow::Result<Option<RecordingRow>> {
    let row = sqlx::query(&db.sql(&format!(
        "SELECT {RECORDING_COLUMNS} FROM terminal_recordings WHERE id = $1"
    )))
    .bind(id)
    .fetch_optional(&db.pool)
    .await?;
    row.as_ref()
        .map(row_to_recording)
        .transpose()
        .map_err(Into::into)
}

#[derive(Debug, Default)]
pub struct RecordingFilter {
    pub recording_type: Option<String>,
    pub user_id: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list(db: &Db, filter: &RecordingFilter) -> anyhow::Result<(Vec<RecordingRow>, i64)> {
    let mut conditions = Vec::new();
    let mut text_args = Vec::new();
    let mut int_args = Vec::new();

    // Text args bind first, then ints, so placeholder numbers stay in order.
    if let Some(ref t) = filter.recording_type {
        text_args.push(t.clone());
        conditions.push(format!("recording_type = ${}", text_args.len()));
    }
    if let Some(ref u) = filter.user_id {
        text_args.push(u.clone());
        conditions.push(format!("user_id = ${}", text_args.len()));
    }
    if let Some(from) = filter.from_ms {
        int_args.push(from);
        conditions.push(format!("started_at >= ${}", text_args.len() + int_args.len()));
    }
    if let Some(to) = filter.to_ms {
        int_args.push(to);
        conditions.push(format!("started_at <= ${}", text_args.len() + int_args.len()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let count_sql = db
        .sql(&format!("SELECT COUNT(*) FROM terminal_recordings{where_clause}"))
        .into_owned();
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for t in &text_args {
        count_query = count_query.bind(t.clone());
    }
    for i in &int_args {
        count_query = count_query.bind(*i);
    }
    let total = count_query.fetch_one(&db.pool).await?;

    let n = text_args.len() + int_args.len();
    let list_sql = db
        .sql(&format!(
            "SELECT {RECORDING_COLUMNS} FROM terminal_recordings{where_clause}
             ORDER BY started_at DESC LIMIT ${} OFFSET ${}",
            n + 1,
            n + 2,
        ))
        .into_owned();
    let mut list_query = sqlx::query(&list_sql);
    for t in &text_args {
        list_query = list_query.bind(t.clone());
    }
    for i in &int_args {
        list_query = list_query.bind(*i);
    }
    let rows = list_query
        .bind(filter.limit.clamp(1, 200))
        .bind(filter.offset.max(0))
        .fetch_all(&db.pool)
        .await?;

    let items = rows
        .iter()
        .map(row_to_recording)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items, total))
}
