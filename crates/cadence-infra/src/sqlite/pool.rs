//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time, so checkpoints from every wave go
//! through a single-connection writer pool while resume lookups use a small
//! read-only pool.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader connections opened by [`DatabasePool::new`]. Resume lookups are
/// rare, so this stays small.
pub const DEFAULT_READERS: u32 = 4;

/// Checkpoint database split into a single writer and a reader pool.
///
/// - `reader`: read-only connections for resume lookups.
/// - `writer`: one connection; every checkpoint upsert is serialized on it.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the database with [`DEFAULT_READERS`] reader connections.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect(database_url, DEFAULT_READERS).await
    }

    /// Open the database, migrate it, then attach `readers` read-only
    /// connections (at least one).
    ///
    /// Runs with `synchronous = NORMAL`: a crash may drop the newest
    /// checkpoints, and those units rerun on resume.
    pub async fn connect(database_url: &str, readers: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        // Opened after migrating: a read-only connection cannot create tables.
        let reader = SqlitePoolOptions::new()
            .max_connections(readers.max(1))
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(database_url, readers = readers.max(1), "opened checkpoint database");
        Ok(Self { reader, writer })
    }
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("reader_size", &self.reader.size())
            .field("writer_size", &self.writer.size())
            .finish()
    }
}

/// Data directory: `CADENCE_DATA_DIR`, else `~/.cadence`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("CADENCE_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence"),
    }
}

/// `sqlite://{data_dir}/cadence.db`
pub fn default_database_url() -> String {
    format!("sqlite://{}", default_data_dir().join("cadence.db").display())
}
