use uuid::Uuid;

use super::pool::Db;
use super::now_ms;
use crate::auth::password;

/// First-run seeding: create the admin account when the users table is empty.
#[tracing::instrument(skip(db, admin_password), err)]
pub async fn run(db: &Db, admin_password: Option<&str>, bcrypt_cost: u32) -> anyhow::Result<()> {
    let count: i64 = sqlx::query_scalar(&db.sql("SELECT COUNT(*) FROM users"))
        .fetch_one(&db.pool)
        .await?;

    if count > 0 {
        tracing::info!("bootstrap skipped — users already exist");
        return Ok(());
    }

    tracing::info!("first run detected — creating admin user");

    let password = admin_password.unwrap_or("admin");
    let hash = password::hash_password(password, bcrypt_cost)?;

    sqlx::query(&db.sql(
        "INSERT INTO users (id, username, password_hash, role, is_active, created_at)
         VALUES ($1, $2, $3, $4, 1, $5)",
    ))
    .bind(Uuid::new_v4().to_string())
    .bind("admin")
    .bind(&hash)
    .bind("admin")
    .bind(now_ms())
    .execute(&db.pool)
    .await?;

    tracing::info!("admin user created");
    Ok(())
}
