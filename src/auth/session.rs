use sqlx::Row;

use crate::store::pool::Db;
use crate::store::now_ms;

pub struct NewSession<'a> {
    /// Caller-supplied so the access token can embed it as the `sid` claim.
    pub id: &'a str,
    pub user_id: &'a str,
    pub token_hash: &'a str,
    pub refresh_hash: &'a str,
    pub expires_at: i64,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Create an auth session and enforce the per-user concurrency cap: when the
/// number of active sessions exceeds `max_concurrent`, the oldest are
/// invalidated. Returns the new session id.
#[tracing::instrument(skip(db, session), fields(user_id = session.user_id), err)]
pub async fn create(db: &Db, session: &NewSession<'_>, max_concurrent: i64) -> anyhow::Result<String> {
    let id = session.id.to_owned();
    let now = now_ms();

    sqlx::query(&db.sql(
        "INSERT INTO auth_sessions
            (id, user_id, token_hash, refresh_hash, issued_at, expires_at,
             last_activity_at, is_active, ip, user_agent)
         VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8, $9)",
    ))
    .bind(&id)
    .bind(session.user_id)
    .bind(session.token_hash)
    .bind(session.refresh_hash)
    .bind(now)
    .bind(session.expires_at)
    .bind(now)
    .bind(session.ip)
    .bind(session.user_agent)
    .execute(&db.pool)
    .await?;

    enforce_cap(db, session.user_id, max_concurrent).await?;
    Ok(id)
}

/// Invalidate the oldest active sessions beyond the cap. Selected in code
/// because MySQL rejects LIMIT inside IN-subqueries.
async fn enforce_cap(db: &Db, user_id: &str, max_concurrent: i64) -> anyhow::Result<()> {
    let rows = sqlx::query(&db.sql(
        "SELECT id FROM auth_sessions
         WHERE user_id = $1 AND is_active = 1
         ORDER BY issued_at DESC, id DESC",
    ))
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;

    let max = usize::try_from(max_concurrent.max(1)).unwrap_or(1);
    if rows.len() <= max {
        return Ok(());
    }

    for row in &rows[max..] {
        let id: String = row.try_get("id")?;
        sqlx::query(&db.sql("UPDATE auth_sessions SET is_active = 0 WHERE id = $1"))
            .bind(&id)
            .execute(&db.pool)
            .await?;
        tracing::debug!(session_id = %id, user_id, "session invalidated by concurrency cap");
    }
    Ok(())
}

/// True when the session exists, is active, and has not expired.
pub async fn is_active(db: &Db, session_id: &str) -> anyhow::Result<bool> {
    let row = sqlx::query(&db.sql(
        "SELECT expires_at FROM auth_sessions WHERE id = $1 AND is_active = 1",
    ))
    .bind(session_id)
    .fetch_optional(&db.pool)
    .await?;

    match row {
        Some(r) => {
            let expires_at: i64 = r.try_get("expires_at")?;
            Ok(expires_at > now_ms())
        }
        None => Ok(false),
    }
}

pub async fn touch(db: &Db, session_id: &str) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "UPDATE auth_sessions SET last_activity_at = $1 WHERE id = $2",
    ))
    .bind(now_ms())
    .bind(session_id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn deactivate(db: &Db, session_id: &str) -> anyhow::Result<()> {
    sqlx::query(&db.sql("UPDATE auth_sessions SET is_active = 0 WHERE id = $1"))
        .bind(session_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

/// Active-session count for a user; used by tests and the admin surface.
pub async fn active_count(db: &Db, user_id: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar(&db.sql(
        "SELECT COUNT(*) FROM auth_sessions WHERE user_id = $1 AND is_active = 1",
    ))
    .bind(user_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(count)
}
