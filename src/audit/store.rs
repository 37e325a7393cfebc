use serde::Serialize;
use sqlx::Row;

use super::AuditRecord;
use crate::store::pool::Db;

/// Write a batch inside one transaction. A row that fails to bind or insert
/// is logged and skipped; the rest of the batch still commits. Returns the
/// number of rows written.
pub async fn write_batch(db: &Db, batch: &[AuditRecord]) -> anyhow::Result<u64> {
    let mut tx = db.pool.begin().await?;
    let mut written = 0u64;

    let sql = db.sql(
        "INSERT INTO audit_events
            (id, ts, subsystem, operator, action, resource_type, resource_name,
             cluster_id, instance_id, success, error_message, client_ip, details)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    );

    for record in batch {
        let e = &record.entry;
        let details = if e.details.is_null() {
            "{}".to_owned()
        } else {
            e.details.to_string()
        };
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.ts)
            .bind(e.subsystem.as_str())
            .bind(&e.operator)
            .bind(&e.action)
            .bind(&e.resource_type)
            .bind(&e.resource_name)
            .bind(e.cluster_id.as_deref())
            .bind(e.instance_id.as_deref())
            .bind(i64::from(e.success))
            .bind(e.error.as_deref())
            .bind(e.client_ip.as_deref())
            .bind(&details)
            .execute(&mut *tx)
            .await;

        match result {
            Ok(_) => written += 1,
            Err(err) => {
                tracing::warn!(error = %err, id = %record.id, "audit row skipped");
            }
        }
    }

    tx.commit().await?;
    Ok(written)
}

#[derive(Debug, Serialize)]
pub struct AuditEventRow {
    pub id: String,
    pub timestamp: i64,
    pub subsystem: String,
    pub operator: String,
    pub action: String,
    pub resource_type: String,
    pub resource_name: String,
    pub cluster_id: Option<String>,
    pub instance_id: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
    pub details: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct AuditFilter {
    pub subsystem: Option<String>,
    pub operator: Option<String>,
    pub action: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

/// Filtered, paginated listing, newest first. Timestamps are the ordering
/// authority across writer workers.
pub async fn list(db: &Db, filter: &AuditFilter) -> anyhow::Result<(Vec<AuditEventRow>, i64)> {
    let mut conditions = Vec::new();
    let mut args: Vec<SqlArg> = Vec::new();

    if let Some(ref s) = filter.subsystem {
        args.push(SqlArg::Text(s.clone()));
        conditions.push(format!("subsystem = ${}", args.len()));
    }
    if let Some(ref op) = filter.operator {
        args.push(SqlArg::Text(op.clone()));
        conditions.push(format!("operator = ${}", args.len()));
    }
    if let Some(ref a) = filter.action {
        args.push(SqlArg::Text(a.clone()));
        conditions.push(format!("action = ${}", args.len()));
    }
    if let Some(from) = filter.from_ms {
        args.push(SqlArg::Int(from));
        conditions.push(format!("ts >= ${}", args.len()));
    }
    if let Some(to) = filter.to_ms {
        args.push(SqlArg::Int(to));
        conditions.push(format!("ts <= ${}", args.len()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let count_sql = db.sql(&format!("SELECT COUNT(*) FROM audit_events{where_clause}"))
        .into_owned();
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for arg in &args {
        count_query = match arg {
            SqlArg::Text(s) => count_query.bind(s.clone()),
            SqlArg::Int(i) => count_query.bind(*i),
        };
    }
    let total = count_query.fetch_one(&db.pool).await?;

    let list_sql = db
        .sql(&format!(
            "SELECT id, ts, subsystem, operator, action, resource_type, resource_name,
                    cluster_id, instance_id, success, error_message, client_ip, details
             FROM audit_events{where_clause}
             ORDER BY ts DESC LIMIT ${} OFFSET ${}",
            args.len() + 1,
            args.len() + 2,
        ))
        .into_owned();
    let mut list_query = sqlx::query(&list_sql);
    for arg in &args {
        list_query = match arg {
            SqlArg::Text(s) => list_query.bind(s.clone()),
            SqlArg::Int(i) => list_query.bind(*i),
        };
    }
    let rows = list_query
        .bind(filter.limit.clamp(1, 500))
        .bind(filter.offset.max(0))
        .fetch_all(&db.pool)
        .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        let details_raw: String = row.try_get("details")?;
        events.push(AuditEventRow {
            id: row.try_get("id")?,
            timestamp: row.try_get("ts")?,
            subsystem: row.try_get("subsystem")?,
            operator: row.try_get("operator")?,
            action: row.try_get("action")?,
            resource_type: row.try_get("resource_type")?,
            resource_name: row.try_get("resource_name")?,
            cluster_id: row.try_get("cluster_id")?,
            instance_id: row.try_get("instance_id")?,
            success: row.try_get::<i64, _>("success")? != 0,
            error_message: row.try_get("error_message")?,
            client_ip: row.try_get("client_ip")?,
            details: serde_json::from_str(&details_raw).unwrap_or(serde_json::Value::Null),
        });
    }

    Ok((events, total))
}

enum SqlArg {
    Text(String),
    Int(i64),
}
