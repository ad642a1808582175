/// Database layer for Aurora ID
///
/// Manages the SQLite connection pool and embedded migrations backing the
/// record store.

use crate::error::{IdpError, IdpResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub enable_wal: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            enable_wal: true,
        }
    }
}

/// Create a SQLite connection pool
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> IdpResult<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(if options.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        })
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(connect_options)
        .await
        .map_err(IdpError::Database)?;

    Ok(pool)
}

/// Create a private in-memory database
///
/// Every SQLite memory connection is its own database, so the pool is pinned
/// to one connection that is never recycled.
pub async fn create_memory_pool() -> IdpResult<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(IdpError::Database)?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(connect_options)
        .await
        .map_err(IdpError::Database)?;

    Ok(pool)
}

/// Run migrations for a database
/// Migrations are embedded at compile time from ./migrations directory
pub async fn run_migrations(pool: &SqlitePool) -> IdpResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| IdpError::Internal(format!("Migration failed: {}", e)))?;

    Ok(())
}

/// Test database connection
pub async fn test_connection(pool: &SqlitePool) -> IdpResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(IdpError::Database)?;

    Ok(())
}
