//! Snapshot vs. cumulative table classification.

use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::{CumulativeTable, EntityId, Snapshot, SnapshotEntry};

const DELTA_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One differing change signal between the stored row and the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDelta {
    Metric {
        old: i64,
        new: i64,
    },
    UpdatedAt {
        old: DateTime<FixedOffset>,
        new: DateTime<FixedOffset>,
    },
}

impl fmt::Display for FieldDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDelta::Metric { old, new } => write!(f, "metric {old} -> {new}"),
            FieldDelta::UpdatedAt { old, new } => write!(
                f,
                "updated_at {} -> {}",
                old.format(DELTA_TIMESTAMP_FORMAT),
                new.format(DELTA_TIMESTAMP_FORMAT)
            ),
        }
    }
}

/// A known entity whose metric or upstream modification time moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedEntity {
    pub entry: SnapshotEntry,
    pub previous_metric: i64,
    pub previous_updated_at: DateTime<FixedOffset>,
    pub first_seen_at: DateTime<FixedOffset>,
    pub deltas: Vec<FieldDelta>,
}

impl ChangedEntity {
    /// Human-readable delta, e.g. `metric 100 -> 150`.
    pub fn describe(&self) -> String {
        self.deltas
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOutcome {
    /// No cumulative table existed; everything is new by construction.
    pub initialization: bool,
    pub new: Vec<SnapshotEntry>,
    pub changed: Vec<ChangedEntity>,
    pub unchanged: Vec<SnapshotEntry>,
}

impl DiffOutcome {
    pub fn classified(&self) -> usize {
        self.new.len() + self.changed.len() + self.unchanged.len()
    }

    pub fn new_ids(&self) -> Vec<EntityId> {
        self.new.iter().map(|entry| entry.id).collect()
    }
}

fn field_deltas(
    entry: &SnapshotEntry,
    previous_metric: i64,
    previous_updated_at: DateTime<FixedOffset>,
) -> Vec<FieldDelta> {
    let mut deltas = Vec::new();
    if entry.metric != previous_metric {
        deltas.push(FieldDelta::Metric {
            old: previous_metric,
            new: entry.metric,
        });
    }
    if entry.updated_at != previous_updated_at {
        deltas.push(FieldDelta::UpdatedAt {
            old: previous_updated_at,
            new: entry.updated_at,
        });
    }
    deltas
}

/// Classifies every snapshot entry as new, changed or unchanged.
///
/// `table == None` means the category has never been persisted. Rows of the
/// table that the snapshot does not mention are ignored.
pub fn diff_snapshot(snapshot: &Snapshot, table: Option<&CumulativeTable>) -> DiffOutcome {
    let Some(table) = table else {
        return DiffOutcome {
            initialization: true,
            new: snapshot.values().cloned().collect(),
            ..DiffOutcome::default()
        };
    };

    let mut outcome = DiffOutcome::default();
    for entry in snapshot.values() {
        let Some(stored) = table.get(entry.id) else {
            outcome.new.push(entry.clone());
            continue;
        };

        let deltas = field_deltas(entry, stored.metric, stored.updated_at);
        if deltas.is_empty() {
            outcome.unchanged.push(entry.clone());
        } else {
            outcome.changed.push(ChangedEntity {
                entry: entry.clone(),
                previous_metric: stored.metric,
                previous_updated_at: stored.updated_at,
                first_seen_at: stored.first_seen_at,
                deltas,
            });
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{at, entry, snapshot};
    use crate::merge_total_table;

    #[test]
    fn first_run_classifies_everything_as_new() {
        let now = at(2025, 11, 1, 9);
        let snap = snapshot(vec![
            entry(1, "a/one", 10, now, now),
            entry(2, "a/two", 20, now, now),
            entry(3, "a/three", 30, now, now),
        ]);

        let outcome = diff_snapshot(&snap, None);

        assert!(outcome.initialization);
        assert_eq!(outcome.new_ids(), vec![EntityId(1), EntityId(2), EntityId(3)]);
        assert!(outcome.changed.is_empty());
        assert!(outcome.unchanged.is_empty());
    }

    #[test]
    fn detects_metric_change_and_new_entity() {
        let d0 = at(2025, 10, 20, 9);
        let u0 = at(2025, 10, 19, 12);
        let u1 = at(2025, 10, 30, 12);
        let now = at(2025, 11, 1, 9);

        let table = merge_total_table(None, &snapshot(vec![entry(42, "x", 100, u0, d0)]));
        let snap = snapshot(vec![entry(42, "x", 150, u0, now), entry(99, "y", 10, u1, now)]);

        let outcome = diff_snapshot(&snap, Some(&table));

        assert!(!outcome.initialization);
        assert_eq!(outcome.new_ids(), vec![EntityId(99)]);
        assert_eq!(outcome.changed.len(), 1);
        let changed = &outcome.changed[0];
        assert_eq!(changed.entry.id, EntityId(42));
        assert_eq!(changed.previous_metric, 100);
        assert_eq!(changed.first_seen_at, d0);
        assert_eq!(changed.deltas, vec![FieldDelta::Metric { old: 100, new: 150 }]);
        assert_eq!(changed.describe(), "metric 100 -> 150");

        let merged = merge_total_table(Some(table), &snap);
        assert_eq!(merged.len(), 2);
        let r42 = merged.get(EntityId(42)).unwrap();
        assert_eq!(r42.metric, 150);
        assert_eq!(r42.first_seen_at, d0);
        assert_eq!(r42.last_seen_at, now);
        let r99 = merged.get(EntityId(99)).unwrap();
        assert_eq!(r99.first_seen_at, now);
        assert_eq!(r99.last_seen_at, now);
    }

    #[test]
    fn updated_at_alone_is_a_change_signal() {
        let d0 = at(2025, 10, 20, 9);
        let now = at(2025, 11, 1, 9);
        let table = merge_total_table(
            None,
            &snapshot(vec![entry(7, "z", 5, at(2025, 10, 19, 12), d0)]),
        );
        let snap = snapshot(vec![entry(7, "z", 5, at(2025, 10, 31, 8), now)]);

        let outcome = diff_snapshot(&snap, Some(&table));

        assert_eq!(outcome.changed.len(), 1);
        assert_eq!(
            outcome.changed[0].describe(),
            "updated_at 2025-10-19 12:00:00 -> 2025-10-31 08:00:00"
        );
    }

    #[test]
    fn unchanged_entities_are_kept_apart_and_absent_ids_are_ignored() {
        let d0 = at(2025, 10, 20, 9);
        let u0 = at(2025, 10, 19, 12);
        let now = at(2025, 11, 1, 9);
        let table = merge_total_table(
            None,
            &snapshot(vec![entry(1, "kept", 5, u0, d0), entry(2, "gone", 9, u0, d0)]),
        );
        let snap = snapshot(vec![entry(1, "kept", 5, u0, now)]);

        let outcome = diff_snapshot(&snap, Some(&table));

        assert!(outcome.new.is_empty());
        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.unchanged.len(), 1);
        assert_eq!(outcome.classified(), 1);
    }

    #[test]
    fn renames_without_signal_change_are_not_reported() {
        let d0 = at(2025, 10, 20, 9);
        let u0 = at(2025, 10, 19, 12);
        let table = merge_total_table(None, &snapshot(vec![entry(1, "old/name", 5, u0, d0)]));
        let snap = snapshot(vec![entry(1, "new/name", 5, u0, at(2025, 11, 1, 9))]);

        let outcome = diff_snapshot(&snap, Some(&table));
        assert_eq!(outcome.unchanged.len(), 1);
    }
}
