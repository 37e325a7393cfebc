use sqlx::Row;
use uuid::Uuid;

use crate::store::now_ms;
use crate::store::pool::Db;

pub struct DatabaseInstance {
    pub id: String,
    pub name: String,
    pub db_type: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password_cipher: String,
    pub ssl_mode: String,
    pub allow_risky_filters: bool,
    pub status: String,
    pub last_check_at: Option<i64>,
    pub created_at: i64,
}

pub struct NewInstance<'a> {
    pub name: &'a str,
    pub db_type: &'a str,
    pub host: &'a str,
    pub port: i64,
    pub username: &'a str,
    pub password_cipher: &'a str,
    pub ssl_mode: &'a str,
    pub allow_risky_filters: bool,
}

fn row_to_instance(row: &sqlx::any::AnyRow) -> Result<DatabaseInstance, sqlx::Error> {
    Ok(DatabaseInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        db_type: row.try_get("db_type")?,
        host: row.try_get("host")?,
        port: row.try_get("port")?,
        username: row.try_get("username")?,
        password_cipher: row.try_get("password_cipher")?,
        ssl_mode: row.try_get("ssl_mode")?,
        allow_risky_filters: row.try_get::<i64, _>("allow_risky_filters")? != 0,
        status: row.try_get("status")?,
        last_check_at: row.try_get("last_check_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const INSTANCE_COLUMNS: &str = "id, name, db_type, host, port, username, password_cipher, \
     ssl_mode, allow_risky_filters, status, last_check_at, created_at";

pub async fn create_instance(db: &Db, new: &NewInstance<'_>) -> anyhow::Result<DatabaseInstance> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(&db.sql(
        "INSERT INTO database_instances
            (id, name, db_type, host, port, username, password_cipher, ssl_mode,
             allow_risky_filters, status, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    ))
    .bind(&id)
    .bind(new.name)
    .bind(new.db_type)
    .bind(new.host)
    .bind(new.port)
    .bind(new.username)
    .bind(new.password_cipher)
    .bind(new.ssl_mode)
    .bind(i64::from(new.allow_risky_filters))
    .bind("unknown")
    .bind(now_ms())
    .execute(&db.pool)
    .await?;

    get_instance(db, &id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("instance vanished after insert"))
}

pub async fn get_instance(db: &Db, id: &str) -> anyhow::Result<Option<DatabaseInstance>> {
    let row = sqlx::query(&db.sql(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM database_instances WHERE id = $1"
    )))
    .bind(id)
    .fetch_optional(&db.pool)
    .await?;
    row.as_ref()
        .map(row_to_instance)
        .transpose()
        .map_err(Into::into)
}

pub async fn list_instances(db: &Db) -> anyhow::Result<Vec<DatabaseInstance>> {
    let rows = sqlx::query(&db.sql(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM database_instances ORDER BY name"
    )))
    .fetch_all(&db.pool)
    .await?;
    rows.iter()
        .map(row_to_instance)
        .collect::<Result<_, _>>()
        .map_err(Into::into)
}

pub async fn update_status(db: &Db, id: &str, status: &str) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "UPDATE database_instances SET status = $1, last_check_at = $2 WHERE id = $3",
    ))
    .bind(status)
    .bind(now_ms())
    .bind(id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Append-only execution record; written once, after the query finishes.
pub struct QuerySessionRecord {
    pub id: String,
    pub instance_id: String,
    pub executed_by: String,
    pub database_name: String,
    pub query_text: String,
    pub query_type: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: i64,
    pub row_count: i64,
    pub bytes_returned: i64,
    /// One of `success`, `error`, `timeout`, `truncated`.
    pub status: String,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
}

pub async fn insert_query_session(db: &Db, rec: &QuerySessionRecord) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "INSERT INTO query_sessions
            (id, instance_id, executed_by, database_name, query_text, query_type,
             started_at, completed_at, duration_ms, row_count, bytes_returned,
             status, error_message, client_ip)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    ))
    .bind(&rec.id)
    .bind(&rec.instance_id)
    .bind(&rec.executed_by)
    .bind(&rec.database_name)
    .bind(&rec.query_text)
    .bind(&rec.query_type)
    .bind(rec.started_at)
    .bind(rec.completed_at)
    .bind(rec.duration_ms)
    .bind(rec.row_count)
    .bind(rec.bytes_returned)
    .bind(&rec.status)
    .bind(rec.error_message.as_deref())
    .bind(rec.client_ip.as_deref())
    .execute(&db.pool)
    .await?;
    Ok(())
}
