use chrono::{TimeZone, Utc};
use cli::{parse_query_type, render_outcome, render_search, render_status, StatusReport};
use notesync_core::classifier::QueryKind;
use notesync_core::error::{ItemFailure, ItemOperation};
use notesync_core::models::{ItemSignature, ScanCoverage, SyncState, SyncTotals};
use notesync_core::pipeline::{CycleOutcome, CycleReport};
use notesync_core::search::{RankedResult, SearchResponse};
use notesync_core::state::StateStore;
use storage::SqliteStateStore;
use tempfile::tempdir;

fn sig(group: &str) -> ItemSignature {
    ItemSignature {
        content_hash: "h".into(),
        modified_at: "2024-05-01T00:00:00Z".into(),
        group: group.into(),
    }
}

#[test]
fn query_type_accepts_auto_and_kinds() {
    assert_eq!(parse_query_type("auto"), Ok(None));
    assert_eq!(parse_query_type(""), Ok(None));
    assert_eq!(parse_query_type("current"), Ok(Some(QueryKind::Current)));
    assert_eq!(parse_query_type("historical"), Ok(Some(QueryKind::Historical)));
    assert!(parse_query_type("recent").is_err());
}

#[tokio::test]
async fn status_reads_persisted_state() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("state.db");
    let store = SqliteStateStore::open(&db.to_string_lossy()).await.unwrap();

    let mut state = SyncState::default();
    state.item_signatures.insert("a".into(), sig("Work"));
    state.item_signatures.insert("b".into(), sig("Work"));
    state.item_signatures.insert("c".into(), sig("Home"));
    state.group_counts.insert("Work".into(), 2);
    state.group_counts.insert("Home".into(), 1);
    state.consecutive_failures = 2;
    state.last_error = Some("embeddings unavailable: connection refused".into());
    state.last_success = Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
    state.last_result = Some(SyncTotals {
        added: 3,
        ..Default::default()
    });
    StateStore::save(&store, &state).await.unwrap();

    let loaded = StateStore::load(&store).await.unwrap();
    let report = StatusReport::from_state(&loaded, None);
    assert_eq!(report.total_items, 3);
    assert_eq!(report.items_per_group.get("Work"), Some(&2));

    let text = render_status(&report);
    assert!(text.contains("items indexed: 3"));
    assert!(text.contains("  Home: 1"));
    assert!(text.contains("consecutive failures: 2"));
    assert!(text.contains("last error: embeddings unavailable"));
    assert!(text.contains("last result: added 3, modified 0, deleted 0, failed 0"));
    assert!(text.contains("last full scan: never"));
    assert!(text.contains("lock: free"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["total_items"], 3);
    assert_eq!(json["group_counts"]["Work"], 2);
}

#[test]
fn unreadable_state_is_reported() {
    let report = StatusReport::unreadable("bad row".into(), Some("pid=42 since=x".into()));
    let text = render_status(&report);
    assert!(text.starts_with("state unreadable: bad row"));
    assert!(text.contains("lock: pid=42 since=x"));
}

#[test]
fn outcomes_render_one_line_each() {
    assert_eq!(
        render_outcome(&CycleOutcome::NoChanges { total_items: 7 }),
        "no changes (7 items)"
    );
    let skipped = CycleOutcome::Skipped {
        reason: "content unavailable: export missing".into(),
        consecutive_failures: 1,
    };
    assert!(render_outcome(&skipped).starts_with("skipped: content unavailable"));

    let synced = CycleOutcome::Synced(CycleReport {
        totals: SyncTotals {
            added: 1,
            modified: 2,
            deleted: 0,
            failed: 1,
            full_sync: false,
        },
        coverage: ScanCoverage::Partial,
        scanned_groups: vec!["Work".into()],
        refreshed: 1,
        failures: vec![ItemFailure {
            id: "w9".into(),
            operation: ItemOperation::Embed,
            message: "input rejected".into(),
        }],
    });
    let text = render_outcome(&synced);
    assert!(text.starts_with("synced: added 1, modified 2, deleted 0, failed 1"));
    assert!(text.contains("1 refreshed"));
    assert!(text.contains("w9"));

    let json = serde_json::to_value(&synced).unwrap();
    assert_eq!(json["outcome"], "synced");
    assert_eq!(json["scanned_groups"][0], "Work");
}

#[test]
fn search_results_render_in_rank_order() {
    let resp = SearchResponse {
        query: "current address".into(),
        profile: QueryKind::Current.profile(),
        results: vec![RankedResult {
            id: "n1".into(),
            title: "Address".into(),
            group: "Personal".into(),
            created_at: "2020-01-01T00:00:00Z".into(),
            modified_at: "2024-04-01T00:00:00Z".into(),
            preview: "12 Elm St\nSpringfield".into(),
            similarity: 0.8,
            freshness: 0.5,
            combined: 0.68,
            score: 0.68,
            profile: "current".into(),
        }],
    };
    let text = render_search(&resp);
    assert!(text.starts_with("query type: current (freshness weight 0.40)"));
    assert!(text.contains("1. Address [Personal] score 0.680"));
    assert!(text.contains("12 Elm St Springfield"));

    let empty = SearchResponse {
        results: Vec::new(),
        ..resp
    };
    assert!(render_search(&empty).contains("no results"));
}
