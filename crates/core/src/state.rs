use crate::error::SyncError;
use crate::models::{ItemSignature, SyncState};
use std::sync::Arc;
use storage::SqliteStateStore;
use tokio::sync::Mutex;

/// Repository for the persisted [`SyncState`].
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<SyncState, SyncError>;

    /// Replace everything.
    async fn save(&self, state: &SyncState) -> Result<(), SyncError>;

    /// Record one reconciled batch: signatures to write and ids to forget.
    async fn commit_items(
        &self,
        upserts: &[(String, ItemSignature)],
        removals: &[String],
    ) -> Result<(), SyncError>;

    /// Group counts and cycle bookkeeping only.
    async fn save_summary(&self, state: &SyncState) -> Result<(), SyncError>;
}

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self) -> Result<SyncState, SyncError> {
        Ok(SqliteStateStore::load(self).await?)
    }

    async fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        Ok(SqliteStateStore::save(self, state).await?)
    }

    async fn commit_items(
        &self,
        upserts: &[(String, ItemSignature)],
        removals: &[String],
    ) -> Result<(), SyncError> {
        Ok(SqliteStateStore::commit_items(self, upserts, removals).await?)
    }

    async fn save_summary(&self, state: &SyncState) -> Result<(), SyncError> {
        Ok(SqliteStateStore::save_summary(self, state).await?)
    }
}

/// Keeps state in process. `corrupted()` starts out unreadable until the first full save.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    state: SyncState,
    corrupt: bool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SyncState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                state,
                corrupt: false,
            })),
        }
    }

    pub fn corrupted() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                state: SyncState::default(),
                corrupt: true,
            })),
        }
    }

    /// Current contents, bypassing the corruption flag.
    pub async fn snapshot(&self) -> SyncState {
        self.inner.lock().await.state.clone()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<SyncState, SyncError> {
        let guard = self.inner.lock().await;
        if guard.corrupt {
            return Err(SyncError::CorruptState("state marked unreadable".into()));
        }
        Ok(guard.state.clone())
    }

    async fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        guard.state = state.clone();
        guard.corrupt = false;
        Ok(())
    }

    async fn commit_items(
        &self,
        upserts: &[(String, ItemSignature)],
        removals: &[String],
    ) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        for (id, sig) in upserts {
            guard.state.item_signatures.insert(id.clone(), sig.clone());
        }
        for id in removals {
            guard.state.item_signatures.remove(id);
        }
        Ok(())
    }

    async fn save_summary(&self, state: &SyncState) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        let signatures = std::mem::take(&mut guard.state.item_signatures);
        guard.state = SyncState {
            item_signatures: signatures,
            ..state.clone()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(hash: &str) -> ItemSignature {
        ItemSignature {
            content_hash: hash.into(),
            modified_at: "t1".into(),
            group: "Work".into(),
        }
    }

    async fn exercise(store: &dyn StateStore) {
        store
            .commit_items(&[("a".into(), sig("h1")), ("b".into(), sig("h2"))], &[])
            .await
            .unwrap();
        let mut summary = SyncState::default();
        summary.consecutive_failures = 2;
        summary.group_counts.insert("Work".into(), 2);
        store.save_summary(&summary).await.unwrap();
        store.commit_items(&[], &["a".into()]).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.item_signatures.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.group_counts.get("Work"), Some(&2));
    }

    #[tokio::test]
    async fn memory_and_sqlite_stores_agree() {
        exercise(&MemoryStateStore::new()).await;
        let sqlite = SqliteStateStore::open("sqlite::memory:").await.unwrap();
        exercise(&sqlite).await;
    }

    #[tokio::test]
    async fn corrupted_store_recovers_after_save() {
        let store = MemoryStateStore::corrupted();
        assert!(matches!(
            store.load().await,
            Err(SyncError::CorruptState(_))
        ));
        store.save(&SyncState::default()).await.unwrap();
        assert!(store.load().await.is_ok());
    }
}
