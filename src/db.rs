//! SQLite connection pool and embedded migrations.

use crate::error::{DbError, Result};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

/// Handle to the persisted store.
#[derive(Debug, Clone)]
pub struct Db {
    pub sqlite: SqlitePool,
}

impl Db {
    /// Open (creating if needed) the database file under `data_dir` and run
    /// pending migrations.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("constituent-hub.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(DbError::SqliteConnect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let sqlite = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        let db = Self { sqlite };
        db.migrate().await?;
        tracing::info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// Single-connection in-memory database with migrations applied. Every
    /// connection to `sqlite::memory:` is its own database, so the pool is
    /// pinned to one connection that never expires.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqliteConnect)?
            .foreign_keys(true);

        let sqlite = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        let db = Self { sqlite };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.sqlite)
            .await
            .map_err(DbError::Migration)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}

/// SQLite extended result code for a UNIQUE constraint violation.
pub const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Whether a sqlx error is a UNIQUE constraint violation.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error)
            if db_error.code().as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE)
    )
}
