use crate::models::{ChangeSet, ItemMetadata, ScanCoverage, SyncState};
use std::collections::HashSet;

fn moved(stored: &str, current: &str) -> bool {
    !stored.is_empty() && stored != current
}

/// Diff a metadata listing against the stored signatures.
///
/// Modification is token inequality on `modified_at` (not ordering) or a move to
/// another group. Deletions are only reported under [`ScanCoverage::Full`]: with a
/// partial listing an absent id may simply live in a group that was not scanned.
pub fn detect_changes(
    observed: &[ItemMetadata],
    state: &SyncState,
    coverage: ScanCoverage,
) -> ChangeSet {
    let mut new = Vec::new();
    let mut modified = Vec::new();
    let mut seen: HashSet<&str> = HashSet::with_capacity(observed.len());

    for meta in observed {
        if !seen.insert(meta.id.as_str()) {
            continue;
        }
        match state.item_signatures.get(&meta.id) {
            None => new.push(meta.id.clone()),
            Some(sig) if sig.modified_at != meta.modified_at || moved(&sig.group, &meta.group) => {
                modified.push(meta.id.clone())
            }
            Some(_) => {}
        }
    }

    let deleted = match coverage {
        ScanCoverage::Full => state
            .item_signatures
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect(),
        ScanCoverage::Partial => Vec::new(),
    };

    ChangeSet {
        new,
        modified,
        deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemSignature;

    fn meta(id: &str, modified: &str) -> ItemMetadata {
        ItemMetadata {
            id: id.into(),
            group: "Work".into(),
            modified_at: modified.into(),
        }
    }

    fn state_with(entries: &[(&str, &str)]) -> SyncState {
        let mut state = SyncState::default();
        for (id, modified) in entries {
            state.item_signatures.insert(
                id.to_string(),
                ItemSignature {
                    content_hash: format!("h-{id}"),
                    modified_at: modified.to_string(),
                    group: "Work".into(),
                },
            );
        }
        state
    }

    #[test]
    fn unchanged_listing_is_empty() {
        let state = state_with(&[("A1", "t1"), ("B2", "t1")]);
        let cs = detect_changes(
            &[meta("A1", "t1"), meta("B2", "t1")],
            &state,
            ScanCoverage::Full,
        );
        assert!(cs.is_empty());
    }

    #[test]
    fn token_change_is_a_modification() {
        let state = state_with(&[("A1", "t1")]);
        let cs = detect_changes(&[meta("A1", "t2")], &state, ScanCoverage::Partial);
        assert_eq!(cs.modified, vec!["A1"]);
        assert!(cs.new.is_empty());
    }

    #[test]
    fn older_token_still_counts_as_modified() {
        let state = state_with(&[("A1", "2024-05-01")]);
        let cs = detect_changes(&[meta("A1", "2024-04-01")], &state, ScanCoverage::Full);
        assert_eq!(cs.modified, vec!["A1"]);
    }

    #[test]
    fn move_between_groups_is_a_modification() {
        let state = state_with(&[("A1", "t1")]);
        let mut moved = meta("A1", "t1");
        moved.group = "Archive".into();
        let cs = detect_changes(&[moved], &state, ScanCoverage::Partial);
        assert_eq!(cs.modified, vec!["A1"]);
    }

    #[test]
    fn deletions_need_full_coverage() {
        let state = state_with(&[("A1", "t1"), ("B2", "t1"), ("C3", "t1")]);
        let listing = [meta("A1", "t1")];

        let partial = detect_changes(&listing, &state, ScanCoverage::Partial);
        assert!(partial.deleted.is_empty());

        let full = detect_changes(&listing, &state, ScanCoverage::Full);
        assert_eq!(full.deleted, vec!["B2", "C3"]);
    }

    #[test]
    fn new_ids_keep_listing_order_and_collapse_duplicates() {
        let state = SyncState::default();
        let cs = detect_changes(
            &[meta("z", "t"), meta("a", "t"), meta("z", "t")],
            &state,
            ScanCoverage::Full,
        );
        assert_eq!(cs.new, vec!["z", "a"]);
    }
}
