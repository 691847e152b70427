//! Storage layer: SQLite pool setup, migrations and the persisted sync state.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub mod models;
pub mod state;

pub use state::SqliteStateStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// A row exists but cannot be decoded into the sync-state schema.
    #[error("corrupt sync state: {0}")]
    Corrupt(String),
}

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}", norm);
        }
    }
    let opts = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    // In-memory databases are per-connection unless shared, so keep a single one.
    let max = if url.contains("memory") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
    // Idempotent; applies crates/storage/migrations.
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// The file behind `database_url`, or `None` for in-memory databases.
pub fn database_file(database_url: &str) -> Option<PathBuf> {
    let path = match database_url.strip_prefix("sqlite:") {
        Some(rest) => {
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            rest.split('?').next().unwrap_or_default()
        }
        None => database_url,
    };
    if path.is_empty() || path.contains(":memory:") {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Whether opening `path` failed because the file itself is not a usable database,
/// as opposed to a locked file or a bad path.
pub(crate) fn unreadable_database(path: &Path, err: &anyhow::Error) -> bool {
    let mut head = Vec::with_capacity(SQLITE_HEADER.len());
    let bad_header = std::fs::File::open(path)
        .and_then(|f| f.take(SQLITE_HEADER.len() as u64).read_to_end(&mut head))
        .map(|_| !head.is_empty() && head != SQLITE_HEADER)
        .unwrap_or(false);
    let refused = err
        .chain()
        .filter_map(|e| e.downcast_ref::<sqlx::Error>())
        .filter_map(|e| e.as_database_error())
        .filter_map(|e| e.code())
        .filter_map(|code| code.parse::<i32>().ok())
        .any(|code| matches!(code & 0xff, SQLITE_CORRUPT | SQLITE_NOTADB));
    bad_header || refused
}

/// Move an unreadable database out of the way, keeping it for inspection.
/// Returns where it went.
pub(crate) fn set_aside(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{stamp}"));
    let aside = PathBuf::from(aside);
    std::fs::rename(path, &aside)?;
    // Journals belong to the old file; sqlite would try to replay them.
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(side);
    }
    Ok(aside)
}
