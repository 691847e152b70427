//! The sync cycle and the builders that wire it from [`AppConfig`].
//!
//! One cycle walks `AcquiringLock -> HealthCheck -> BaselineCheck -> FullSync |
//! IncrementalSync -> Reconcile -> PersistState -> ReleaseLock`, bailing out to
//! `Skipped` when a collaborator is down.

use crate::alert::{Alert, Alerter, LogAlerter};
use crate::config::{AppConfig, SyncConfig};
use crate::content::{ContentProvider, ExportDirProvider, MemoryProvider};
use crate::detector::detect_changes;
use crate::embeddings::Embedder;
use crate::error::{ItemFailure, SyncError};
use crate::lease::{FileLease, SyncLease};
use crate::models::{ChangeSet, GroupCount, ItemMetadata, ScanCoverage, SyncState, SyncTotals};
use crate::prefilter::{quick_check, QuickCheck};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::search::SearchService;
use crate::state::StateStore;
use crate::vectorstore::{MemoryIndex, QdrantIndex, VectorIndex};
use anyhow::Context;
use chrono::{DateTime, Utc};
use providers::noop::NoopProvider;
use providers::openai::{OpenAiConfig, OpenAiProvider};
use providers::qdrant::QdrantClient;
use providers::ProviderRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::SqliteStateStore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    AcquiringLock,
    HealthCheck,
    Skipped,
    BaselineCheck,
    FullSync,
    IncrementalSync,
    Reconcile,
    PersistState,
    ReleaseLock,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::AcquiringLock => "acquiring_lock",
            CyclePhase::HealthCheck => "health_check",
            CyclePhase::Skipped => "skipped",
            CyclePhase::BaselineCheck => "baseline_check",
            CyclePhase::FullSync => "full_sync",
            CyclePhase::IncrementalSync => "incremental_sync",
            CyclePhase::Reconcile => "reconcile",
            CyclePhase::PersistState => "persist_state",
            CyclePhase::ReleaseLock => "release_lock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub totals: SyncTotals,
    pub coverage: ScanCoverage,
    pub scanned_groups: Vec<String>,
    pub refreshed: usize,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another cycle holds the lease. Not a failure.
    AlreadyRunning,
    /// A collaborator failed its health check; nothing was touched.
    Skipped {
        reason: String,
        consecutive_failures: u32,
    },
    NoChanges {
        total_items: u64,
    },
    Synced(CycleReport),
    Failed {
        error: String,
        consecutive_failures: u32,
    },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::NoChanges { .. } | CycleOutcome::Synced(_))
    }
}

/// Everything a cycle talks to.
#[derive(Clone)]
pub struct SyncComponents {
    pub content: Arc<dyn ContentProvider>,
    pub embedder: Embedder,
    pub index: Arc<dyn VectorIndex>,
    pub store: Arc<dyn StateStore>,
    pub lease: Arc<dyn SyncLease>,
    pub alerter: Arc<dyn Alerter>,
}

pub struct Orchestrator {
    parts: SyncComponents,
    reconciler: Reconciler,
    cfg: SyncConfig,
    dims: usize,
}

struct Pass {
    report: ReconcileReport,
    coverage: ScanCoverage,
    scanned_groups: Vec<String>,
    group_counts: BTreeMap<String, u64>,
    full_sync: bool,
}

impl Orchestrator {
    pub fn new(parts: SyncComponents, cfg: SyncConfig, dims: usize) -> Self {
        let reconciler = Reconciler::new(
            parts.embedder.clone(),
            parts.index.clone(),
            cfg.batch_size,
            cfg.fetch_timeout,
        );
        Self {
            parts,
            reconciler,
            cfg,
            dims,
        }
    }

    fn enter(&self, phase: CyclePhase) {
        debug!(phase = phase.as_str(), "sync phase");
    }

    /// Run one cycle. Only fatal errors (refused access, bad configuration) and
    /// state-store breakage come back as `Err`; everything else is an outcome.
    pub async fn run_cycle(&self, force: bool) -> Result<CycleOutcome, SyncError> {
        self.enter(CyclePhase::AcquiringLock);
        let Some(guard) = self.parts.lease.try_acquire()? else {
            info!("another sync is running, skipping this cycle");
            return Ok(CycleOutcome::AlreadyRunning);
        };
        let outcome = self.locked_cycle(force).await;
        self.enter(CyclePhase::ReleaseLock);
        drop(guard);
        self.enter(CyclePhase::Idle);
        outcome
    }

    async fn locked_cycle(&self, force: bool) -> Result<CycleOutcome, SyncError> {
        let (mut state, corrupt) = match self.parts.store.load().await {
            Ok(state) => (state, false),
            Err(SyncError::CorruptState(msg)) => {
                warn!(error = %msg, "sync state unreadable, rebuilding from scratch");
                (SyncState::default(), true)
            }
            Err(e) => return Err(e),
        };
        let started = Utc::now();
        state.last_sync = Some(started);

        self.enter(CyclePhase::HealthCheck);
        if let Err(e) = self.health_gate().await {
            self.record_failure(&mut state, &e).await;
            if e.is_fatal() {
                return Err(e);
            }
            self.enter(CyclePhase::Skipped);
            warn!(error = %e, failures = state.consecutive_failures, "skipping sync");
            return Ok(CycleOutcome::Skipped {
                reason: e.to_string(),
                consecutive_failures: state.consecutive_failures,
            });
        }

        let pass = match self.sync_pass(&mut state, force, corrupt, started).await {
            Ok(Some(pass)) => pass,
            Ok(None) => {
                self.enter(CyclePhase::PersistState);
                let total_items: u64 = state.group_counts.values().sum();
                self.record_success(&mut state, SyncTotals::default(), false)
                    .await?;
                info!(total_items, "no changes");
                return Ok(CycleOutcome::NoChanges { total_items });
            }
            Err(e) => {
                self.record_failure(&mut state, &e).await;
                if e.is_fatal() {
                    return Err(e);
                }
                error!(error = %e, failures = state.consecutive_failures, "sync failed");
                return Ok(CycleOutcome::Failed {
                    error: e.to_string(),
                    consecutive_failures: state.consecutive_failures,
                });
            }
        };

        self.enter(CyclePhase::PersistState);
        let totals = SyncTotals {
            added: pass.report.added,
            modified: pass.report.modified,
            deleted: pass.report.deleted,
            failed: pass.report.failures.len(),
            full_sync: pass.full_sync,
        };
        state.group_counts = pass.group_counts;
        if pass.coverage == ScanCoverage::Full {
            state.last_full_scan = Some(started);
        }
        self.record_success(&mut state, totals.clone(), pass.full_sync || corrupt)
            .await?;

        for failure in &pass.report.failures {
            warn!(
                id = %failure.id,
                operation = %failure.operation,
                error = %failure.message,
                "item not synced"
            );
        }
        info!(
            added = totals.added,
            modified = totals.modified,
            deleted = totals.deleted,
            failed = totals.failed,
            refreshed = pass.report.refreshed,
            full = totals.full_sync,
            "sync complete"
        );
        Ok(CycleOutcome::Synced(CycleReport {
            totals,
            coverage: pass.coverage,
            scanned_groups: pass.scanned_groups,
            refreshed: pass.report.refreshed,
            failures: pass.report.failures,
        }))
    }

    async fn health_gate(&self) -> Result<(), SyncError> {
        self.parts.embedder.health().await?;
        self.parts.content.health_check().await?;
        self.parts.index.health().await?;
        Ok(())
    }

    /// `Ok(None)` when the quick check finds nothing to do.
    async fn sync_pass(
        &self,
        state: &mut SyncState,
        force: bool,
        corrupt: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Pass>, SyncError> {
        self.enter(CyclePhase::BaselineCheck);
        let fresh = corrupt || !state.has_baseline();
        if fresh {
            self.parts.index.reset(self.dims).await?;
        } else {
            self.parts.index.ensure_collection(self.dims).await?;
        }
        let index_lost = !fresh && self.parts.index.count().await? == 0;
        if index_lost {
            warn!("index is empty but state has a baseline, rebuilding");
        }

        if force || fresh || index_lost {
            self.enter(CyclePhase::FullSync);
            info!(force, fresh, "running full sync");
            return self.full_pass(state).await.map(Some);
        }

        self.enter(CyclePhase::IncrementalSync);
        self.incremental_pass(state, now).await
    }

    async fn list_groups(&self) -> Result<Vec<GroupCount>, SyncError> {
        let limit = Duration::from_secs(self.cfg.list_timeout_secs.max(1));
        tokio::time::timeout(limit, self.parts.content.list_groups())
            .await
            .map_err(|_| SyncError::unavailable("content", "listing groups timed out"))?
    }

    async fn list_group(&self, group: &str, count: u64) -> Result<Vec<ItemMetadata>, SyncError> {
        let limit = self.cfg.metadata_timeout.for_items(count as usize);
        tokio::time::timeout(limit, self.parts.content.list_item_metadata(Some(group)))
            .await
            .map_err(|_| {
                SyncError::unavailable(
                    "content",
                    format!("listing '{group}' timed out after {}s", limit.as_secs()),
                )
            })?
    }

    async fn scan(
        &self,
        counts: &BTreeMap<String, u64>,
        groups: &[String],
    ) -> Result<Vec<ItemMetadata>, SyncError> {
        let mut observed = Vec::new();
        for group in groups {
            let count = counts.get(group).copied().unwrap_or(0);
            if count == 0 {
                continue;
            }
            debug!(group = %group, count, "scanning group");
            observed.extend(self.list_group(group, count).await?);
        }
        Ok(observed)
    }

    async fn full_pass(&self, state: &mut SyncState) -> Result<Pass, SyncError> {
        let groups = self.list_groups().await?;
        let qc = quick_check(&groups, &state.group_counts);
        let all: Vec<String> = qc.current_counts.keys().cloned().collect();
        let observed = self.scan(&qc.current_counts, &all).await?;

        let universe: BTreeSet<&str> = observed.iter().map(|m| m.id.as_str()).collect();
        let mut changes = ChangeSet::default();
        for id in &universe {
            if state.item_signatures.contains_key(*id) {
                changes.modified.push(id.to_string());
            } else {
                changes.new.push(id.to_string());
            }
        }
        changes.deleted = state
            .item_signatures
            .keys()
            .filter(|id| !universe.contains(id.as_str()))
            .cloned()
            .collect();
        info!(
            items = universe.len(),
            stale = changes.deleted.len(),
            "full reconciliation"
        );

        self.enter(CyclePhase::Reconcile);
        let report = self
            .reconciler
            .reconcile_all(
                &changes,
                self.parts.content.as_ref(),
                self.parts.store.as_ref(),
                state,
                &observed,
            )
            .await?;
        let group_counts = settle_counts(&qc, &state.group_counts, &report.failed_groups);
        Ok(Pass {
            report,
            coverage: ScanCoverage::Full,
            scanned_groups: all,
            group_counts,
            full_sync: true,
        })
    }

    fn sweep_due(&self, state: &SyncState, now: DateTime<Utc>) -> bool {
        if self.cfg.full_scan_interval_hours == 0 {
            return false;
        }
        match state.last_full_scan {
            None => true,
            Some(last) => {
                now - last >= chrono::Duration::hours(self.cfg.full_scan_interval_hours as i64)
            }
        }
    }

    async fn incremental_pass(
        &self,
        state: &mut SyncState,
        now: DateTime<Utc>,
    ) -> Result<Option<Pass>, SyncError> {
        let groups = self.list_groups().await?;
        let qc = quick_check(&groups, &state.group_counts);
        let sweep = self.sweep_due(state, now);
        if !qc.has_changes && !sweep {
            return Ok(None);
        }

        let (coverage, to_scan): (ScanCoverage, Vec<String>) = if sweep || qc.suspects_deletion() {
            (ScanCoverage::Full, qc.current_counts.keys().cloned().collect())
        } else {
            (ScanCoverage::Partial, qc.groups_to_scan())
        };
        info!(
            changed = qc.changed_groups.len(),
            new = qc.new_groups.len(),
            deleted = qc.deleted_groups.len(),
            sweep,
            coverage = ?coverage,
            "scanning groups"
        );
        let observed = self.scan(&qc.current_counts, &to_scan).await?;
        let changes = detect_changes(&observed, state, coverage);
        info!(
            new = changes.new.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "changes detected"
        );

        self.enter(CyclePhase::Reconcile);
        let report = self
            .reconciler
            .reconcile(
                &changes,
                self.parts.content.as_ref(),
                self.parts.store.as_ref(),
                state,
                &observed,
            )
            .await?;
        let group_counts = settle_counts(&qc, &state.group_counts, &report.failed_groups);
        Ok(Some(Pass {
            report,
            coverage,
            scanned_groups: to_scan,
            group_counts,
            full_sync: false,
        }))
    }

    async fn record_success(
        &self,
        state: &mut SyncState,
        totals: SyncTotals,
        replace_all: bool,
    ) -> Result<(), SyncError> {
        state.consecutive_failures = 0;
        state.last_success = state.last_sync;
        state.last_result = Some(totals);
        if replace_all {
            self.parts.store.save(state).await
        } else {
            self.parts.store.save_summary(state).await
        }
    }

    /// Bump the failure counter and alert at the threshold. Signatures are not touched.
    async fn record_failure(&self, state: &mut SyncState, err: &SyncError) {
        state.consecutive_failures += 1;
        state.last_error = Some(err.to_string());
        if let Err(save_err) = self.parts.store.save_summary(state).await {
            error!(error = %save_err, "could not record sync failure");
        }
        if state.consecutive_failures >= self.cfg.alert_threshold {
            self.parts.alerter.alert(&Alert {
                consecutive_failures: state.consecutive_failures,
                last_error: err.to_string(),
            });
        }
    }

    /// Run cycles every `interval` until `shutdown` resolves or a fatal error occurs.
    pub async fn run_daemon<F>(&self, interval: Duration, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "sync daemon started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("sync daemon stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.run_cycle(false).await {
                        Ok(outcome) => debug!(?outcome, "cycle finished"),
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "fatal sync error, stopping daemon");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "cycle errored, will retry next interval"),
                    }
                }
            }
        }
    }
}

/// Counts to persist after a pass. Groups with a failed item keep their previous
/// count (or none) so the next quick check scans them again.
fn settle_counts(
    qc: &QuickCheck,
    stored: &BTreeMap<String, u64>,
    failed_groups: &BTreeSet<String>,
) -> BTreeMap<String, u64> {
    let mut counts = qc.current_counts.clone();
    for group in failed_groups {
        match stored.get(group) {
            Some(old) => {
                counts.insert(group.clone(), *old);
            }
            None => {
                counts.remove(group);
            }
        }
    }
    counts
}

pub fn build_registry(config: &AppConfig) -> anyhow::Result<ProviderRegistry> {
    let mut reg = ProviderRegistry::new().with_embedding("noop", Arc::new(NoopProvider));

    let emb = &config.embeddings;
    let openai_key = emb
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    if emb.provider == "openai" {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: openai_key,
            base_url: emb.base_url.clone(),
            embedding_model: emb.model.clone(),
            timeout_secs: emb.timeout_secs,
        })
        .context("openai client")?;
        reg = reg.with_embedding("openai", Arc::new(provider));
    }

    if emb.provider == "lmstudio" {
        let base = std::env::var("LMSTUDIO_BASE_URL").unwrap_or_else(|_| emb.base_url.clone());
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: emb.api_key.clone(),
            base_url: base,
            embedding_model: emb.model.clone(),
            timeout_secs: emb.timeout_secs,
        })
        .context("lmstudio client")?;
        reg = reg.with_embedding("lmstudio", Arc::new(provider));
    }

    Ok(reg.set_preferred_embedding(&emb.provider))
}

pub fn build_embedder(config: &AppConfig) -> anyhow::Result<Embedder> {
    let registry = build_registry(config)?;
    let provider = registry.embedding(None)?;
    Ok(Embedder::new(provider, &config.embeddings))
}

pub fn build_vector_index(config: &AppConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match config.vectors.provider.as_str() {
        "qdrant" => {
            let url = config
                .vectors
                .url
                .clone()
                .context("vectors.url is required for qdrant")?;
            let client = QdrantClient::new(providers::qdrant::QdrantConfig {
                url,
                collection: config.vectors.collection.clone(),
                api_key: config
                    .vectors
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("QDRANT_API_KEY").ok()),
                timeout_secs: config.vectors.timeout_secs,
            })?;
            Ok(Arc::new(QdrantIndex::new(client)))
        }
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        other => anyhow::bail!("unknown vectors.provider '{other}'"),
    }
}

pub fn build_content_provider(config: &AppConfig) -> anyhow::Result<Arc<dyn ContentProvider>> {
    match config.content.provider.as_str() {
        "export_dir" => {
            let dir = config
                .content
                .export_dir
                .clone()
                .context("content.export_dir is required")?;
            Ok(Arc::new(ExportDirProvider::new(dir)))
        }
        "memory" => Ok(Arc::new(MemoryProvider::new())),
        other => anyhow::bail!("unknown content.provider '{other}'"),
    }
}

pub async fn open_state_store(config: &AppConfig) -> anyhow::Result<SqliteStateStore> {
    SqliteStateStore::open(&config.database.path)
        .await
        .with_context(|| format!("opening state database {}", config.database.path))
}

pub async fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let store = open_state_store(config).await?;
    let parts = SyncComponents {
        content: build_content_provider(config)?,
        embedder: build_embedder(config)?,
        index: build_vector_index(config)?,
        store: Arc::new(store),
        lease: Arc::new(FileLease::new(&config.sync.lock_path)),
        alerter: Arc::new(LogAlerter),
    };
    Ok(Orchestrator::new(
        parts,
        config.sync.clone(),
        config.embeddings.dims,
    ))
}

pub fn build_search_service(config: &AppConfig) -> anyhow::Result<SearchService> {
    Ok(SearchService::new(
        build_embedder(config)?,
        build_vector_index(config)?,
        config.search.clone(),
    )?)
}
