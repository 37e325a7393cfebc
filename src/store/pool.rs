use std::borrow::Cow;
use std::sync::Once;
use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::config::DatabaseConfig;

static INSTALL_DRIVERS: Once = Once::new();

/// Register the sqlite/mysql/postgres drivers with the `Any` driver. Needed
/// before any `Any` connection, including single-use query-executor dials.
pub fn ensure_drivers() {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
}

/// Relational backend variant behind the `Any` pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    MySql,
    Postgres,
}

impl DbKind {
    pub fn from_url(url: &str) -> anyhow::Result<Self> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("mysql:") {
            Ok(Self::MySql)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Self::Postgres)
        } else {
            anyhow::bail!("unsupported database url scheme: {url}")
        }
    }
}

/// Handle over the server's own store: a bounded `Any` pool plus the backend
/// kind, which drives placeholder rewriting.
#[derive(Clone)]
pub struct Db {
    pub pool: AnyPool,
    pub kind: DbKind,
}

impl Db {
    #[tracing::instrument(skip(url, cfg), err)]
    pub async fn connect(url: &str, cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        ensure_drivers();

        let kind = DbKind::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(cfg.max_open_conns)
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .max_lifetime(Duration::from_secs(cfg.conn_max_lifetime_secs))
            .connect(url)
            .await?;

        tracing::info!(?kind, "connected to database");
        Ok(Self { pool, kind })
    }

    /// Single-connection pool for tests and embedded use.
    pub async fn connect_lite(url: &str) -> anyhow::Result<Self> {
        ensure_drivers();
        let kind = DbKind::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        Ok(Self { pool, kind })
    }

    /// Canonical SQL in this codebase uses `$1..$n` placeholders, which both
    /// Postgres and SQLite accept natively. MySQL only understands `?`.
    pub fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self.kind {
            DbKind::MySql => Cow::Owned(strip_dollar_placeholders(query)),
            _ => Cow::Borrowed(query),
        }
    }
}

fn strip_dollar_placeholders(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(char::is_ascii_digit) {
            while chars.peek().is_some_and(char::is_ascii_digit) {
                chars.next();
            }
            out.push('?');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_url() {
        assert_eq!(DbKind::from_url("sqlite::memory:").unwrap(), DbKind::Sqlite);
        assert_eq!(
            DbKind::from_url("mysql://u:p@h/db").unwrap(),
            DbKind::MySql
        );
        assert_eq!(
            DbKind::from_url("postgres://u:p@h/db").unwrap(),
            DbKind::Postgres
        );
        assert!(DbKind::from_url("mongodb://h/db").is_err());
    }

    #[test]
    fn placeholders_rewritten_for_mysql() {
        assert_eq!(
            strip_dollar_placeholders("SELECT * FROM t WHERE a = $1 AND b = $12"),
            "SELECT * FROM t WHERE a = ? AND b = ?"
        );
    }

    #[test]
    fn dollar_without_digit_untouched() {
        assert_eq!(strip_dollar_placeholders("SELECT '$x'"), "SELECT '$x'");
    }
}
