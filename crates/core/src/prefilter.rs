//! Per-group count comparison that decides whether a metadata scan is needed at all.
//!
//! Equal counts rule out additions and deletions, but an edit in place leaves every
//! count unchanged and is invisible here. Forced and periodic full scans cover that.

use crate::models::GroupCount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDelta {
    pub group: String,
    pub old_count: u64,
    pub new_count: u64,
    pub delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickCheck {
    pub has_changes: bool,
    pub changed_groups: Vec<GroupDelta>,
    pub new_groups: Vec<String>,
    pub deleted_groups: Vec<String>,
    pub total_items: u64,
    pub stored_total: u64,
    pub current_counts: BTreeMap<String, u64>,
}

impl QuickCheck {
    /// Groups whose items must be listed: changed ones, then new ones.
    pub fn groups_to_scan(&self) -> Vec<String> {
        self.changed_groups
            .iter()
            .map(|g| g.group.clone())
            .chain(self.new_groups.iter().cloned())
            .collect()
    }

    /// A group vanished or shrank, so some stored id is likely gone.
    pub fn suspects_deletion(&self) -> bool {
        !self.deleted_groups.is_empty() || self.changed_groups.iter().any(|g| g.delta < 0)
    }
}

pub fn quick_check(current: &[GroupCount], stored: &BTreeMap<String, u64>) -> QuickCheck {
    let mut current_counts = BTreeMap::new();
    for gc in current {
        *current_counts.entry(gc.group.clone()).or_insert(0) += gc.count;
    }

    let mut changed_groups = Vec::new();
    let mut new_groups = Vec::new();
    for (group, &count) in &current_counts {
        match stored.get(group) {
            None => new_groups.push(group.clone()),
            Some(&old) if old != count => changed_groups.push(GroupDelta {
                group: group.clone(),
                old_count: old,
                new_count: count,
                delta: count as i64 - old as i64,
            }),
            Some(_) => {}
        }
    }
    let deleted_groups: Vec<String> = stored
        .keys()
        .filter(|g| !current_counts.contains_key(*g))
        .cloned()
        .collect();

    QuickCheck {
        has_changes: !(changed_groups.is_empty()
            && new_groups.is_empty()
            && deleted_groups.is_empty()),
        changed_groups,
        new_groups,
        deleted_groups,
        total_items: current_counts.values().sum(),
        stored_total: stored.values().sum(),
        current_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u64)]) -> Vec<GroupCount> {
        pairs
            .iter()
            .map(|(g, c)| GroupCount {
                group: g.to_string(),
                count: *c,
            })
            .collect()
    }

    fn stored(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(g, c)| (g.to_string(), *c)).collect()
    }

    #[test]
    fn unchanged_counts_mean_no_changes() {
        let qc = quick_check(
            &counts(&[("Work", 10), ("Personal", 4)]),
            &stored(&[("Work", 10), ("Personal", 4)]),
        );
        assert!(!qc.has_changes);
        assert!(qc.groups_to_scan().is_empty());
        assert_eq!(qc.total_items, 14);
        assert_eq!(qc.stored_total, 14);
    }

    #[test]
    fn one_new_note_in_work() {
        let qc = quick_check(
            &counts(&[("Work", 11), ("Personal", 4)]),
            &stored(&[("Work", 10), ("Personal", 4)]),
        );
        assert!(qc.has_changes);
        assert_eq!(
            qc.changed_groups,
            vec![GroupDelta {
                group: "Work".into(),
                old_count: 10,
                new_count: 11,
                delta: 1,
            }]
        );
        assert_eq!(qc.groups_to_scan(), vec!["Work"]);
        assert!(!qc.suspects_deletion());
    }

    #[test]
    fn new_and_deleted_groups() {
        let qc = quick_check(
            &counts(&[("Work", 10), ("Recipes", 2)]),
            &stored(&[("Work", 10), ("Archive", 3)]),
        );
        assert_eq!(qc.new_groups, vec!["Recipes"]);
        assert_eq!(qc.deleted_groups, vec!["Archive"]);
        assert_eq!(qc.groups_to_scan(), vec!["Recipes"]);
        assert!(qc.suspects_deletion());
    }

    #[test]
    fn shrinking_group_suspects_deletion() {
        let qc = quick_check(&counts(&[("Work", 9)]), &stored(&[("Work", 10)]));
        assert_eq!(qc.changed_groups[0].delta, -1);
        assert!(qc.suspects_deletion());
    }

    #[test]
    fn empty_baseline_reports_everything_new() {
        let qc = quick_check(&counts(&[("Work", 1)]), &BTreeMap::new());
        assert_eq!(qc.new_groups, vec!["Work"]);
        assert_eq!(qc.stored_total, 0);
    }
}
