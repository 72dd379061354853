use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::Config;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS settings (
        scope    TEXT    NOT NULL,
        scope_id INTEGER NOT NULL,
        key      TEXT    NOT NULL,
        value    TEXT    NOT NULL,
        PRIMARY KEY (scope, scope_id, key)
    )",
    "CREATE INDEX IF NOT EXISTS settings_value ON settings (scope, value)",
    "CREATE TABLE IF NOT EXISTS chat_streaks (
        guild_id     INTEGER NOT NULL,
        member_id    INTEGER NOT NULL,
        last_message TEXT    NOT NULL,
        start_time   TEXT    NOT NULL,
        PRIMARY KEY (guild_id, member_id)
    )",
];

pub(crate) async fn connect(config: &Config) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    tracing::info!(url = %config.database_url, "database ready");
    Ok(pool)
}

pub(crate) async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut connection = pool.acquire().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *connection).await?;
    }
    Ok(())
}

pub(crate) async fn close(pool: SqlitePool) {
    pool.close().await;
    tracing::info!("database closed");
}

/// A private in-memory database. One connection that never idles out, since
/// every new connection to `sqlite::memory:` would see an empty database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_schema(&pool).await.expect("schema");
    pool
}

/// A database file inside `dir`, shared by `max_connections` connections.
#[cfg(test)]
pub(crate) async fn file_pool(dir: &tempfile::TempDir, max_connections: u32) -> SqlitePool {
    let config = Config {
        discord_token: String::new(),
        database_url: format!("sqlite://{}", dir.path().join("akabot.sqlite").display()),
        max_connections,
    };
    connect(&config).await.expect("file-backed sqlite")
}
