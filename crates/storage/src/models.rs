use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the last successful observation of an item looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSignature {
    pub content_hash: String,
    pub modified_at: String,
    #[serde(default)]
    pub group: String,
}

/// Counts reported by one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTotals {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub failed: usize,
    #[serde(default)]
    pub full_sync: bool,
}

impl SyncTotals {
    pub fn changes(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub item_signatures: BTreeMap<String, ItemSignature>,
    pub group_counts: BTreeMap<String, u64>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_result: Option<SyncTotals>,
    pub last_full_scan: Option<DateTime<Utc>>,
}

impl SyncState {
    /// A baseline exists once at least one item has been recorded.
    pub fn has_baseline(&self) -> bool {
        !self.item_signatures.is_empty()
    }

    pub fn total_items(&self) -> usize {
        self.item_signatures.len()
    }

    /// Signature count per group, for status output.
    pub fn items_per_group(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for sig in self.item_signatures.values() {
            *out.entry(sig.group.clone()).or_insert(0) += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_requires_signatures() {
        let mut state = SyncState::default();
        assert!(!state.has_baseline());
        state.group_counts.insert("Work".into(), 3);
        assert!(!state.has_baseline());
        state.item_signatures.insert(
            "a".into(),
            ItemSignature {
                content_hash: "h".into(),
                modified_at: "t".into(),
                group: "Work".into(),
            },
        );
        assert!(state.has_baseline());
        assert_eq!(state.items_per_group().get("Work"), Some(&1));
    }
}
