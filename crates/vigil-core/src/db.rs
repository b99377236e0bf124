//! `SQLite` plumbing for the lease store.
//!
//! The control plane keeps its lease table in `SQLite`. Every lease mutation
//! is one conditional `UPDATE`, so the pool is tuned for many short writers:
//! WAL journaling and a busy timeout instead of application-level locking.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    /// The store cannot be reached; callers fail closed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl DatabaseError {
    /// True when retrying later may succeed without operator action.
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(e.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Open the lease database at `path`, creating it and its directory on first
/// use.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let pool = connect(&url, 5).await?;
    info!(path = %path.display(), "Lease database opened");
    Ok(pool)
}

/// Private in-memory database. One connection, since each `SQLite` memory
/// connection is its own database.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    connect("sqlite::memory:", 1).await
}

async fn connect(url: &str, max_connections: u32) -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| DatabaseError::Unavailable(format!("{url}: {e}")))?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);
    debug!(url, max_connections, "Connecting lease database");
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Unavailable(e.to_string()))
}

/// Wall-clock unix seconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Declare a database handle type with embedded migrations from the calling
/// crate's `./migrations` directory.
///
/// ```ignore
/// vigil_core::define_database!(ControlDatabase, "Control database migrations complete");
/// ```
#[macro_export]
macro_rules! define_database {
    ($name:ident, $migrated:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::migrated($crate::db::open_pool(path).await?).await
            }

            /// Fresh private database, mostly for tests.
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::migrated($crate::db::open_pool_in_memory().await?).await
            }

            async fn migrated(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;
                ::tracing::info!($migrated);
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }

            /// Close the pool. Later queries report the store as unavailable.
            pub async fn close(&self) {
                self.pool.close().await;
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_past_2024() {
        assert!(unix_timestamp() > 1_704_067_200);
    }

    #[tokio::test]
    async fn file_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vigil.db");
        assert!(open_pool(&path).await.is_ok());
        assert!(path.parent().is_some_and(Path::exists));
    }

    #[tokio::test]
    async fn closed_pool_reports_unavailable() {
        let pool = open_pool_in_memory().await.unwrap();
        pool.close().await;
        let err: DatabaseError = sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .unwrap_err()
            .into();
        assert!(err.is_unavailable(), "{err:?}");
    }
}
