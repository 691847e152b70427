//! SQLite-backed repository for [`SyncState`].
//!
//! Signatures are committed in small transactions as the reconciler makes
//! progress; cycle bookkeeping is written separately so a failed health check
//! can bump the failure counter without touching any signature.

use crate::models::{ItemSignature, SyncState, SyncTotals};
use crate::StorageError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Sqlite, SqlitePool, Transaction, Type};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const KEY_LAST_SYNC: &str = "last_sync";
const KEY_LAST_SUCCESS: &str = "last_success";
const KEY_FAILURES: &str = "consecutive_failures";
const KEY_LAST_ERROR: &str = "last_error";
const KEY_LAST_RESULT: &str = "last_result";
const KEY_LAST_FULL_SCAN: &str = "last_full_scan";

#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    /// Set when `open` had to replace an unreadable file. Reported by `load`
    /// until the next full `save`.
    replaced: Arc<Mutex<Option<String>>>,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            replaced: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect and migrate in one step.
    ///
    /// A file that is not a SQLite database is renamed to
    /// `<file>.corrupt-<timestamp>` and a fresh one is created in its place; the
    /// first `load` then reports [`StorageError::Corrupt`] so callers rebuild.
    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        let err = match open_pool(database_url).await {
            Ok(pool) => return Ok(Self::new(pool)),
            Err(err) => err,
        };
        let Some(path) = crate::database_file(database_url) else {
            return Err(err);
        };
        if !crate::unreadable_database(&path, &err) {
            return Err(err);
        }
        let aside = crate::set_aside(&path)?;
        tracing::warn!(
            path = %path.display(),
            kept_at = %aside.display(),
            error = %err,
            "state database unreadable, starting a new one"
        );
        let store = Self::new(open_pool(database_url).await?);
        store.set_replaced(Some(format!(
            "unreadable database moved to {}",
            aside.display()
        )));
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn replaced(&self) -> Option<String> {
        match self.replaced.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_replaced(&self, message: Option<String>) {
        match self.replaced.lock() {
            Ok(mut guard) => *guard = message,
            Err(poisoned) => *poisoned.into_inner() = message,
        }
    }

    /// Any row that does not decode into the schema is reported as
    /// [`StorageError::Corrupt`].
    pub async fn load(&self) -> Result<SyncState, StorageError> {
        if let Some(message) = self.replaced() {
            return Err(StorageError::Corrupt(message));
        }
        let mut state = SyncState::default();

        let rows = sqlx::query("SELECT id, content_hash, modified_at, grp FROM item_signatures")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let id: String = column(&row, "id")?;
            state.item_signatures.insert(
                id,
                ItemSignature {
                    content_hash: column(&row, "content_hash")?,
                    modified_at: column(&row, "modified_at")?,
                    group: column(&row, "grp")?,
                },
            );
        }

        let rows = sqlx::query("SELECT grp, count FROM group_counts")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let count: i64 = column(&row, "count")?;
            if count < 0 {
                return Err(StorageError::Corrupt(format!("negative group count {count}")));
            }
            state.group_counts.insert(column(&row, "grp")?, count as u64);
        }

        let rows = sqlx::query("SELECT key, value FROM sync_meta")
            .fetch_all(&self.pool)
            .await?;
        let meta: BTreeMap<String, String> = rows
            .iter()
            .map(|r| -> Result<(String, String), StorageError> {
                Ok((column(r, "key")?, column(r, "value")?))
            })
            .collect::<Result<_, StorageError>>()?;

        state.last_sync = parse_ts(&meta, KEY_LAST_SYNC)?;
        state.last_success = parse_ts(&meta, KEY_LAST_SUCCESS)?;
        state.last_full_scan = parse_ts(&meta, KEY_LAST_FULL_SCAN)?;
        state.consecutive_failures = match meta.get(KEY_FAILURES) {
            Some(v) => v
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("{KEY_FAILURES}={v}")))?,
            None => 0,
        };
        state.last_error = meta.get(KEY_LAST_ERROR).cloned();
        state.last_result = match meta.get(KEY_LAST_RESULT) {
            Some(v) => Some(
                serde_json::from_str::<SyncTotals>(v)
                    .map_err(|e| StorageError::Corrupt(format!("{KEY_LAST_RESULT}: {e}")))?,
            ),
            None => None,
        };

        Ok(state)
    }

    /// Replace the whole persisted state.
    pub async fn save(&self, state: &SyncState) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM item_signatures")
            .execute(&mut *tx)
            .await?;
        for (id, sig) in &state.item_signatures {
            upsert_signature(&mut tx, id, sig).await?;
        }
        write_summary(&mut tx, state).await?;
        tx.commit().await?;
        self.set_replaced(None);
        tracing::debug!(items = state.item_signatures.len(), "sync state replaced");
        Ok(())
    }

    /// Apply signature changes for one reconciled batch atomically.
    pub async fn commit_items(
        &self,
        upserts: &[(String, ItemSignature)],
        removals: &[String],
    ) -> Result<(), StorageError> {
        if upserts.is_empty() && removals.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (id, sig) in upserts {
            upsert_signature(&mut tx, id, sig).await?;
        }
        for id in removals {
            sqlx::query("DELETE FROM item_signatures WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::debug!(
            upserts = upserts.len(),
            removals = removals.len(),
            "signatures committed"
        );
        Ok(())
    }

    /// Persist group counts and cycle bookkeeping, leaving signatures alone.
    pub async fn save_summary(&self, state: &SyncState) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        write_summary(&mut tx, state).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn open_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = crate::connect(database_url).await?;
    if let Err(e) = crate::migrate(&pool).await {
        pool.close().await;
        return Err(e.into());
    }
    Ok(pool)
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Corrupt(format!("{name}: {e}")))
}

async fn upsert_signature(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    sig: &ItemSignature,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO item_signatures (id, content_hash, modified_at, grp)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            content_hash = excluded.content_hash,
            modified_at = excluded.modified_at,
            grp = excluded.grp
        "#,
    )
    .bind(id)
    .bind(&sig.content_hash)
    .bind(&sig.modified_at)
    .bind(&sig.group)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_summary(
    tx: &mut Transaction<'_, Sqlite>,
    state: &SyncState,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM group_counts")
        .execute(&mut **tx)
        .await?;
    for (group, count) in &state.group_counts {
        sqlx::query("INSERT INTO group_counts (grp, count) VALUES (?1, ?2)")
            .bind(group)
            .bind(*count as i64)
            .execute(&mut **tx)
            .await?;
    }

    let last_result = match &state.last_result {
        Some(r) => Some(
            serde_json::to_string(r).map_err(|e| StorageError::Corrupt(e.to_string()))?,
        ),
        None => None,
    };
    let entries: [(&str, Option<String>); 6] = [
        (KEY_LAST_SYNC, state.last_sync.map(|t| t.to_rfc3339())),
        (KEY_LAST_SUCCESS, state.last_success.map(|t| t.to_rfc3339())),
        (KEY_LAST_FULL_SCAN, state.last_full_scan.map(|t| t.to_rfc3339())),
        (KEY_FAILURES, Some(state.consecutive_failures.to_string())),
        (KEY_LAST_ERROR, state.last_error.clone()),
        (KEY_LAST_RESULT, last_result),
    ];
    for (key, value) in entries {
        match value {
            Some(v) => {
                sqlx::query(
                    "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(key)
                .bind(v)
                .execute(&mut **tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM sync_meta WHERE key = ?1")
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
        }
    }
    Ok(())
}

fn parse_ts(
    meta: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    match meta.get(key) {
        Some(v) => DateTime::parse_from_rfc3339(v)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| StorageError::Corrupt(format!("{key}={v}: {e}"))),
        None => Ok(None),
    }
}
