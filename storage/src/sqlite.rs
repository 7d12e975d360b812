use async_trait::async_trait;
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};

use marcus_core::error::{CoreError, Result};
use marcus_core::store::StateStore;

/// SQL backend over SQLite with connection pooling and WAL journaling.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn sqlx_err(context: &str, err: sqlx::Error) -> CoreError {
    CoreError::PersistenceFailure(format!("{context}: {err}"))
}

impl SqliteStore {
    /// Connect to the given database URL (`sqlite://...`, a bare file path,
    /// or `:memory:` for tests), creating the database when missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:")
            || database_url.starts_with("sqlite://")
        {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false)
        {
            Sqlite::create_database(&db_url)
                .await
                .map_err(|e| sqlx_err("create database", e))?;
            tracing::info!(url = %db_url, "database created");
        }

        let connect_options = if db_url.contains(":memory:") {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_url)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
                .busy_timeout(std::time::Duration::from_secs(5))
        };

        let pool = if db_url.contains(":memory:") {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(connect_options)
                .await
                .map_err(|e| sqlx_err("connect", e))?
        } else {
            SqlitePool::connect_with(connect_options)
                .await
                .map_err(|e| sqlx_err("connect", e))?
        };
        Ok(Self { pool })
    }

    /// Apply pending migrations. Call once after connecting.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::PersistenceFailure(format!("migration failed: {e}")))?;
        tracing::info!("database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_err("put", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("get", e))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("delete", e))?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        // Escape LIKE metacharacters; record keys are plain but ids are
        // caller-supplied.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let rows = sqlx::query(
            "SELECT key, value FROM state WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(format!("{escaped}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sqlx_err("scan", e))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}
