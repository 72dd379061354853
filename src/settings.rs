use sqlx::SqlitePool;

use crate::error::Result;

/// Namespace a setting lives in. Guild and user settings never collide even
/// when a guild and a user share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Guild,
    User,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Guild => "guild",
            Scope::User => "user",
        }
    }
}

/// Durable string settings for one [`Scope`], keyed by `(scope_id, key)`.
///
/// Reading a key that was never written stores the caller's default and
/// returns it, so every feature can treat "not configured yet" the same as
/// "configured to the default". Values are plain text; parsing them is up to
/// the caller.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
    scope: Scope,
}

// Discord snowflakes fit in 63 bits, SQLite integers are signed.
fn sql_id(id: u64) -> i64 {
    id as i64
}

impl SettingsStore {
    pub fn new(pool: SqlitePool, scope: Scope) -> Self {
        Self { pool, scope }
    }

    pub fn guild(pool: SqlitePool) -> Self {
        Self::new(pool, Scope::Guild)
    }

    pub fn user(pool: SqlitePool) -> Self {
        Self::new(pool, Scope::User)
    }

    /// Returns the stored value, persisting `default` first if the key is absent.
    ///
    /// Keys that already exist are a plain read. A missing key goes through a
    /// single upsert, so concurrent first reads neither duplicate the row nor
    /// fail; whichever insert lands first wins and every caller sees its value.
    pub async fn get(&self, scope_id: u64, key: &str, default: &str) -> Result<String> {
        let mut connection = self.pool.acquire().await?;
        let stored = sqlx::query_scalar::<_, String>(
            "SELECT value FROM settings WHERE scope = ? AND scope_id = ? AND key = ?",
        )
        .bind(self.scope.as_str())
        .bind(sql_id(scope_id))
        .bind(key)
        .fetch_optional(&mut *connection)
        .await?;
        if let Some(value) = stored {
            return Ok(value);
        }

        let value = sqlx::query_scalar::<_, String>(
            "INSERT INTO settings (scope, scope_id, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT (scope, scope_id, key) DO UPDATE SET value = settings.value
             RETURNING value",
        )
        .bind(self.scope.as_str())
        .bind(sql_id(scope_id))
        .bind(key)
        .bind(default)
        .fetch_one(&mut *connection)
        .await?;
        Ok(value)
    }

    /// Returns the stored value without materializing anything.
    pub async fn find(&self, scope_id: u64, key: &str) -> Result<Option<String>> {
        let mut connection = self.pool.acquire().await?;
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM settings WHERE scope = ? AND scope_id = ? AND key = ?",
        )
        .bind(self.scope.as_str())
        .bind(sql_id(scope_id))
        .bind(key)
        .fetch_optional(&mut *connection)
        .await?;
        Ok(value)
    }

    pub async fn set(&self, scope_id: u64, key: &str, value: &str) -> Result<()> {
        let mut connection = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO settings (scope, scope_id, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT (scope, scope_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(self.scope.as_str())
        .bind(sql_id(scope_id))
        .bind(key)
        .bind(value)
        .execute(&mut *connection)
        .await?;
        tracing::debug!(scope = ?self.scope, scope_id, key, value, "setting stored");
        Ok(())
    }

    pub async fn unset(&self, scope_id: u64, key: &str) -> Result<()> {
        let mut connection = self.pool.acquire().await?;
        sqlx::query("DELETE FROM settings WHERE scope = ? AND scope_id = ? AND key = ?")
            .bind(self.scope.as_str())
            .bind(sql_id(scope_id))
            .bind(key)
            .execute(&mut *connection)
            .await?;
        Ok(())
    }

    /// Every `(scope_id, key)` in this scope whose value equals `value`.
    /// Full scan; meant for administrative lookups only.
    pub async fn search_by_value(&self, value: &str) -> Result<Vec<(u64, String)>> {
        let mut connection = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT scope_id, key FROM settings WHERE scope = ? AND value = ?
             ORDER BY scope_id, key",
        )
        .bind(self.scope.as_str())
        .bind(value)
        .fetch_all(&mut *connection)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(scope_id, key)| (scope_id as u64, key))
            .collect())
    }

    /// All materialized `(key, value)` pairs for one scope id, sorted by key.
    pub async fn entries(&self, scope_id: u64) -> Result<Vec<(String, String)>> {
        let mut connection = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM settings WHERE scope = ? AND scope_id = ? ORDER BY key",
        )
        .bind(self.scope.as_str())
        .bind(sql_id(scope_id))
        .fetch_all(&mut *connection)
        .await?;
        Ok(rows)
    }
}
