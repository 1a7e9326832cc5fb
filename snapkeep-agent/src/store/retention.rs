//! Maximum-count retention.

use super::ledger::BackupRecord;
use std::collections::HashSet;

/// Outcome of applying the retention ceiling to a ledger.
#[derive(Debug, Default)]
pub struct Selection {
    /// Records to keep, in their original ledger order
    pub keep: Vec<BackupRecord>,
    /// Records past the ceiling, oldest last
    pub evict: Vec<BackupRecord>,
}

/// Keep the `max_count` most recent records by `created_at`.
///
/// Records with identical timestamps are ranked by ledger position, later
/// entries counting as newer.
pub fn select(records: Vec<BackupRecord>, max_count: usize) -> Selection {
    if records.len() <= max_count {
        return Selection {
            keep: records,
            evict: Vec::new(),
        };
    }

    let mut ranked: Vec<(usize, &BackupRecord)> = records.iter().enumerate().collect();
    ranked.sort_by(|(ia, a), (ib, b)| (b.created_at, *ib).cmp(&(a.created_at, *ia)));

    let kept: HashSet<usize> = ranked.iter().take(max_count).map(|(idx, _)| *idx).collect();
    let evict_order: Vec<usize> = ranked.iter().skip(max_count).map(|(idx, _)| *idx).collect();

    let mut slots: Vec<Option<BackupRecord>> = records.into_iter().map(Some).collect();
    let evict = evict_order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect();
    let keep = slots
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| kept.contains(idx))
        .filter_map(|(_, r)| r)
        .collect();

    Selection { keep, evict }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::path::PathBuf;

    fn record(id: &str, offset_secs: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            original_file_name: "f.txt".into(),
            archive_file_name: format!("f_{}.txt", id),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
            size_bytes: 1,
            content_digest: id.to_string(),
            source_path: PathBuf::from("/f.txt"),
            supplementary_asset: None,
        }
    }

    fn ids(records: &[BackupRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_under_ceiling_is_noop() {
        let selection = select(vec![record("a", 0), record("b", 1)], 2);
        assert_eq!(ids(&selection.keep), vec!["a", "b"]);
        assert!(selection.evict.is_empty());
    }

    #[test]
    fn test_keeps_newest_in_ledger_order() {
        let records = vec![
            record("a", 0),
            record("b", 1),
            record("c", 2),
            record("d", 3),
            record("e", 4),
        ];
        let selection = select(records, 2);

        assert_eq!(ids(&selection.keep), vec!["d", "e"]);
        assert_eq!(ids(&selection.evict), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ordering_uses_timestamps_not_position() {
        // Ledger order deliberately scrambled
        let records = vec![record("new", 50), record("old", 0), record("mid", 20)];
        let selection = select(records, 1);

        assert_eq!(ids(&selection.keep), vec!["new"]);
        assert_eq!(ids(&selection.evict), vec!["mid", "old"]);
    }

    #[test]
    fn test_bound_holds_for_every_ceiling() {
        for total in 0..8usize {
            for max in 1..6usize {
                let records: Vec<BackupRecord> = (0..total)
                    .map(|i| record(&i.to_string(), i as i64))
                    .collect();
                let selection = select(records, max);

                assert_eq!(selection.keep.len(), total.min(max));
                assert_eq!(selection.keep.len() + selection.evict.len(), total);
                let newest_evicted = selection.evict.iter().map(|r| r.created_at).max();
                let oldest_kept = selection.keep.iter().map(|r| r.created_at).min();
                if let (Some(evicted), Some(kept)) = (newest_evicted, oldest_kept) {
                    assert!(evicted < kept);
                }
            }
        }
    }
}
