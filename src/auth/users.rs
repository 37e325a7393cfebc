use sqlx::Row;

use crate::store::pool::Db;

pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub is_active: bool,
}

fn row_to_user(row: &sqlx::any::AnyRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: row.try_get("role")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
    })
}

pub async fn find_by_username(db: &Db, username: &str) -> anyhow::Result<Option<User>> {
    let row = sqlx::query(&db.sql(
        "SELECT id, username, password_hash, role, is_active FROM users WHERE username = $1",
    ))
    .bind(username)
    .fetch_optional(&db.pool)
    .await?;
    row.as_ref().map(row_to_user).transpose().map_err(Into::into)
}

pub async fn find_by_id(db: &Db, id: &str) -> anyhow::Result<Option<User>> {
    let row = sqlx::query(&db.sql(
        "SELECT id, username, password_hash, role, is_active FROM users WHERE id = $1",
    ))
    .bind(id)
    .fetch_optional(&db.pool)
    .await?;
    row.as_ref().map(row_to_user).transpose().map_err(Into::into)
}
