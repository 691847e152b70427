//! Applies a [`ChangeSet`] to the vector index and the state store.
//!
//! Work happens in batches. Each batch is fetched, embedded one item at a time,
//! written to the index (delete, then insert) and then committed to the state store,
//! so an interrupted cycle keeps every batch that finished. A failing item is
//! recorded and skipped; its stored signature is left alone so it shows up as
//! changed again next cycle. An unreachable embedder or content source aborts the
//! run with the error instead.

use crate::config::ScaledTimeout;
use crate::content::ContentProvider;
use crate::embeddings::Embedder;
use crate::error::{ItemFailure, ItemOperation, SyncError};
use crate::models::{ChangeSet, ContentItem, IndexRecord, ItemMetadata, ItemSignature, SyncState};
use crate::state::StateStore;
use crate::vectorstore::VectorIndex;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Modified items whose body was unchanged; signature refreshed without embedding.
    pub refreshed: usize,
    pub failures: Vec<ItemFailure>,
    /// Groups holding at least one failed item.
    pub failed_groups: BTreeSet<String>,
}

struct BatchContext<'a> {
    new_ids: HashSet<&'a str>,
    always_embed: bool,
}

pub struct Reconciler {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    batch_size: usize,
    fetch_timeout: ScaledTimeout,
}

impl Reconciler {
    pub fn new(
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        batch_size: usize,
        fetch_timeout: ScaledTimeout,
    ) -> Self {
        Self {
            embedder,
            index,
            batch_size: batch_size.max(1),
            fetch_timeout,
        }
    }

    pub async fn reconcile(
        &self,
        changes: &ChangeSet,
        provider: &dyn ContentProvider,
        store: &dyn StateStore,
        state: &mut SyncState,
        observed: &[ItemMetadata],
    ) -> Result<ReconcileReport, SyncError> {
        self.run(changes, provider, store, state, observed, false).await
    }

    /// Like [`reconcile`](Self::reconcile) but embeds every item even when its body
    /// is unchanged. Used for full rebuilds.
    pub async fn reconcile_all(
        &self,
        changes: &ChangeSet,
        provider: &dyn ContentProvider,
        store: &dyn StateStore,
        state: &mut SyncState,
        observed: &[ItemMetadata],
    ) -> Result<ReconcileReport, SyncError> {
        self.run(changes, provider, store, state, observed, true).await
    }

    async fn run(
        &self,
        changes: &ChangeSet,
        provider: &dyn ContentProvider,
        store: &dyn StateStore,
        state: &mut SyncState,
        observed: &[ItemMetadata],
        always_embed: bool,
    ) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport::default();
        let batch_ctx = BatchContext {
            new_ids: changes.new.iter().map(String::as_str).collect(),
            always_embed,
        };
        let groups: HashMap<&str, &str> = observed
            .iter()
            .map(|m| (m.id.as_str(), m.group.as_str()))
            .collect();

        let to_upsert = changes.to_upsert();
        let total_batches = to_upsert.len().div_ceil(self.batch_size);
        for (n, batch) in to_upsert.chunks(self.batch_size).enumerate() {
            info!(
                batch = n + 1,
                of = total_batches,
                items = batch.len(),
                "reconciling batch"
            );
            let failures_before = report.failures.len();
            self.upsert_batch(batch, &batch_ctx, provider, store, state, &mut report)
                .await?;
            for failure in &report.failures[failures_before..] {
                let group = groups
                    .get(failure.id.as_str())
                    .map(|g| g.to_string())
                    .or_else(|| state.item_signatures.get(&failure.id).map(|s| s.group.clone()))
                    .unwrap_or_default();
                report.failed_groups.insert(group);
            }
        }

        for batch in changes.deleted.chunks(self.batch_size) {
            self.index.delete(batch).await?;
            store.commit_items(&[], batch).await?;
            for id in batch {
                state.item_signatures.remove(id);
            }
            report.deleted += batch.len();
            debug!(items = batch.len(), "removed deleted items");
        }

        Ok(report)
    }

    /// Fetch one batch. An unreachable source or a timeout aborts the cycle.
    async fn fetch(
        &self,
        ids: &[String],
        provider: &dyn ContentProvider,
    ) -> Result<Vec<ContentItem>, SyncError> {
        let limit = self.fetch_timeout.for_items(ids.len());
        match tokio::time::timeout(limit, provider.fetch_items(ids)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::unavailable(
                "content",
                format!("fetch timed out after {}s", limit.as_secs()),
            )),
        }
    }

    async fn upsert_batch(
        &self,
        batch: &[String],
        ctx: &BatchContext<'_>,
        provider: &dyn ContentProvider,
        store: &dyn StateStore,
        state: &mut SyncState,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        let fetched = match self.fetch(batch, provider).await {
            Ok(items) => items,
            Err(e) if e.is_fatal() || e.is_transient() => return Err(e),
            Err(e) => {
                let message = e.to_string();
                warn!(items = batch.len(), error = %message, "batch fetch failed");
                report
                    .failures
                    .extend(batch.iter().map(|id| ItemFailure {
                        id: id.clone(),
                        operation: ItemOperation::Fetch,
                        message: message.clone(),
                    }));
                return Ok(());
            }
        };
        let mut by_id: HashMap<String, ContentItem> =
            fetched.into_iter().map(|i| (i.id.clone(), i)).collect();

        let synced_at = Utc::now();
        let mut records = Vec::new();
        let mut committed: Vec<(String, ItemSignature)> = Vec::new();
        let mut added = 0;
        let mut modified = 0;
        let mut refreshed = 0;

        for id in batch {
            let Some(item) = by_id.remove(id) else {
                report.failures.push(ItemFailure {
                    id: id.clone(),
                    operation: ItemOperation::Fetch,
                    message: "not returned by content source".into(),
                });
                continue;
            };
            let signature = item.signature();

            if let Some(stored) = state.item_signatures.get(id).filter(|_| !ctx.always_embed) {
                if stored.content_hash == signature.content_hash && stored.group == signature.group
                {
                    debug!(id = %id, "metadata-only change, skipping embedding");
                    committed.push((id.clone(), signature));
                    refreshed += 1;
                    continue;
                }
            }

            match self.embedder.embed_item(&item).await {
                Ok(vector) => {
                    records.push(IndexRecord::from_item(&item, vector, synced_at));
                    committed.push((id.clone(), signature));
                    if ctx.new_ids.contains(id.as_str()) {
                        added += 1;
                    } else {
                        modified += 1;
                    }
                }
                Err(e) if e.is_fatal() || e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(id = %id, error = %e, "embedding failed, item skipped");
                    report.failures.push(ItemFailure {
                        id: id.clone(),
                        operation: ItemOperation::Embed,
                        message: e.to_string(),
                    });
                }
            }
        }

        if !records.is_empty() {
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            self.index.delete(&ids).await?;
            self.index.upsert(records).await?;
        }
        store.commit_items(&committed, &[]).await?;
        for (id, sig) in committed {
            state.item_signatures.insert(id, sig);
        }
        report.added += added;
        report.modified += modified;
        report.refreshed += refreshed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::content::MemoryProvider;
    use crate::detector::detect_changes;
    use crate::models::ScanCoverage;
    use crate::state::MemoryStateStore;
    use crate::vectorstore::MemoryIndex;
    use providers::{EmbedResponse, EmbeddingProvider, ProviderError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Embeds to a fixed two-dimensional vector; refuses texts containing "poison".
    struct StubEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(ProviderError::RequestFailed("rejected input".into()));
            }
            if texts.iter().any(|t| t.contains("outage")) {
                return Err(ProviderError::Unavailable("connection refused".into()));
            }
            Ok(EmbedResponse {
                vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
            })
        }

        async fn health(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn item(id: &str, group: &str, body: &str, modified: &str) -> ContentItem {
        ContentItem {
            id: id.into(),
            title: id.into(),
            body: body.into(),
            plaintext: String::new(),
            group: group.into(),
            created_at: String::new(),
            modified_at: modified.into(),
        }
    }

    struct Fixture {
        reconciler: Reconciler,
        provider: MemoryProvider,
        store: MemoryStateStore,
        index: MemoryIndex,
        stub: Arc<StubEmbedder>,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let stub = Arc::new(StubEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cfg = EmbeddingConfig {
            dims: 2,
            ..Default::default()
        };
        let embedder = Embedder::new(stub.clone(), &cfg).with_retry(0, Duration::from_millis(1));
        let index = MemoryIndex::new();
        Fixture {
            reconciler: Reconciler::new(
                embedder,
                Arc::new(index.clone()),
                batch_size,
                ScaledTimeout::default(),
            ),
            provider: MemoryProvider::new(),
            store: MemoryStateStore::new(),
            index,
            stub,
        }
    }

    async fn run(f: &Fixture, state: &mut SyncState) -> ReconcileReport {
        let observed = f.provider.list_item_metadata(None).await.unwrap();
        let changes = detect_changes(&observed, state, ScanCoverage::Full);
        f.reconciler
            .reconcile(&changes, &f.provider, &f.store, state, &observed)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn modified_item_is_reembedded_with_new_signature() {
        let f = fixture(10);
        f.provider.upsert(item("A1", "Personal", "12 Elm St", "t1")).await;
        let mut state = SyncState::default();
        let report = run(&f, &mut state).await;
        assert_eq!(report.added, 1);
        let old_hash = state.item_signatures["A1"].content_hash.clone();

        f.provider.upsert(item("A1", "Personal", "98 Oak Ave", "t2")).await;
        let report = run(&f, &mut state).await;
        assert_eq!(report.modified, 1);

        let sig = &state.item_signatures["A1"];
        assert_eq!(sig.modified_at, "t2");
        assert_ne!(sig.content_hash, old_hash);
        assert_eq!(sig.content_hash, crate::models::content_hash("98 Oak Ave"));
        assert_eq!(f.store.snapshot().await.item_signatures["A1"], *sig);
        assert_eq!(f.index.get("A1").await.unwrap().modified_at, "t2");
        assert_eq!(f.index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn metadata_only_change_skips_embedding() {
        let f = fixture(10);
        f.provider.upsert(item("A1", "Work", "same body", "t1")).await;
        let mut state = SyncState::default();
        run(&f, &mut state).await;
        let calls = f.stub.calls.load(Ordering::SeqCst);

        f.provider.upsert(item("A1", "Work", "same body", "t2")).await;
        let report = run(&f, &mut state).await;
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.modified, 0);
        assert_eq!(f.stub.calls.load(Ordering::SeqCst), calls);
        assert_eq!(state.item_signatures["A1"].modified_at, "t2");
    }

    #[tokio::test]
    async fn reconcile_all_reembeds_unchanged_bodies() {
        let f = fixture(10);
        f.provider.upsert(item("A1", "Work", "same body", "t1")).await;
        let mut state = SyncState::default();
        run(&f, &mut state).await;
        let calls = f.stub.calls.load(Ordering::SeqCst);

        let observed = f.provider.list_item_metadata(None).await.unwrap();
        let changes = ChangeSet {
            modified: vec!["A1".into()],
            ..Default::default()
        };
        let report = f
            .reconciler
            .reconcile_all(&changes, &f.provider, &f.store, &mut state, &observed)
            .await
            .unwrap();
        assert_eq!(report.modified, 1);
        assert_eq!(f.stub.calls.load(Ordering::SeqCst), calls + 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let f = fixture(2);
        f.provider.upsert(item("a", "Work", "fine", "t1")).await;
        f.provider.upsert(item("b", "Work", "poison pill", "t1")).await;
        f.provider.upsert(item("c", "Home", "also fine", "t1")).await;
        let mut state = SyncState::default();
        let report = run(&f, &mut state).await;

        assert_eq!(report.added, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "b");
        assert_eq!(report.failures[0].operation, ItemOperation::Embed);
        assert_eq!(report.failed_groups, BTreeSet::from(["Work".to_string()]));
        assert!(!state.item_signatures.contains_key("b"));
        assert_eq!(f.index.ids().await, vec!["a", "c"]);

        // Still new next time round, and succeeds once fixed.
        f.provider.upsert(item("b", "Work", "cured", "t2")).await;
        let report = run(&f, &mut state).await;
        assert_eq!(report.added, 1);
        assert!(report.failures.is_empty());
        assert_eq!(f.index.ids().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn deletions_leave_no_orphans() {
        let f = fixture(1);
        for id in ["a", "b", "c"] {
            f.provider.upsert(item(id, "Work", id, "t1")).await;
        }
        let mut state = SyncState::default();
        run(&f, &mut state).await;
        f.provider.remove("b").await;
        let report = run(&f, &mut state).await;
        assert_eq!(report.deleted, 1);

        let stored: Vec<String> = f.store.snapshot().await.item_signatures.into_keys().collect();
        assert_eq!(stored, f.index.ids().await);
        assert_eq!(stored, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn unreachable_index_fails_the_cycle() {
        let f = fixture(10);
        f.provider.upsert(item("a", "Work", "x", "t1")).await;
        f.index.set_unavailable(true).await;
        let observed = f.provider.list_item_metadata(None).await.unwrap();
        let mut state = SyncState::default();
        let changes = detect_changes(&observed, &state, ScanCoverage::Full);
        let err = f
            .reconciler
            .reconcile(&changes, &f.provider, &f.store, &mut state, &observed)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(f.store.snapshot().await.item_signatures.is_empty());
    }

    #[tokio::test]
    async fn unreachable_embedder_aborts_but_keeps_finished_batches() {
        let f = fixture(1);
        f.provider.upsert(item("a", "Work", "fine", "t1")).await;
        f.provider.upsert(item("b", "Work", "during outage", "t1")).await;
        f.provider.upsert(item("c", "Work", "never reached", "t1")).await;
        let observed = f.provider.list_item_metadata(None).await.unwrap();
        let mut state = SyncState::default();
        let changes = detect_changes(&observed, &state, ScanCoverage::Full);
        let err = f
            .reconciler
            .reconcile(&changes, &f.provider, &f.store, &mut state, &observed)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().contains("embeddings unavailable"));
        assert_eq!(f.index.ids().await, vec!["a"]);
        let stored: Vec<String> = f.store.snapshot().await.item_signatures.into_keys().collect();
        assert_eq!(stored, vec!["a"]);
    }

    #[tokio::test]
    async fn unreachable_source_during_fetch_aborts() {
        let f = fixture(10);
        f.provider.upsert(item("a", "Work", "x", "t1")).await;
        let observed = f.provider.list_item_metadata(None).await.unwrap();
        let mut state = SyncState::default();
        let changes = detect_changes(&observed, &state, ScanCoverage::Full);
        f.provider.set_unavailable(Some("export missing")).await;
        let err = f
            .reconciler
            .reconcile(&changes, &f.provider, &f.store, &mut state, &observed)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(f.store.snapshot().await.item_signatures.is_empty());
    }

    #[tokio::test]
    async fn vanished_item_is_a_fetch_failure() {
        let f = fixture(10);
        let observed = vec![ItemMetadata {
            id: "ghost".into(),
            group: "Work".into(),
            modified_at: "t1".into(),
        }];
        let mut state = SyncState::default();
        let changes = detect_changes(&observed, &state, ScanCoverage::Partial);
        let report = f
            .reconciler
            .reconcile(&changes, &f.provider, &f.store, &mut state, &observed)
            .await
            .unwrap();
        assert_eq!(report.failures[0].operation, ItemOperation::Fetch);
        assert!(report.failed_groups.contains("Work"));
    }
}
