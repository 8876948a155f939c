//! Change-log accumulation and cumulative table folding.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};

use crate::{
    ChangeKind, ChangedEntity, CumulativeTable, DiffOutcome, EntityId, EntityRecord, Snapshot,
};

/// Prior values of the change signals, kept for changed rows only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousValues {
    pub metric: i64,
    pub updated_at: DateTime<FixedOffset>,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogRow {
    pub record: EntityRecord,
    pub previous: Option<PreviousValues>,
}

impl ChangeLogRow {
    pub fn id(&self) -> EntityId {
        self.record.id
    }

    fn from_changed(changed: &ChangedEntity) -> Self {
        Self {
            record: changed.entry.clone().into_record(changed.first_seen_at),
            previous: Some(PreviousValues {
                metric: changed.previous_metric,
                updated_at: changed.previous_updated_at,
                delta: changed.describe(),
            }),
        }
    }
}

/// Day-scoped store of one kind for one category, at most one row per id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLog {
    kind: ChangeKind,
    rows: BTreeMap<EntityId, ChangeLogRow>,
}

impl ChangeLog {
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            rows: BTreeMap::new(),
        }
    }

    /// Builds a log from stored rows; a repeated id keeps the later row.
    pub fn from_rows(kind: ChangeKind, rows: impl IntoIterator<Item = ChangeLogRow>) -> Self {
        let mut log = Self::new(kind);
        for row in rows {
            log.rows.insert(row.id(), row);
        }
        log
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&ChangeLogRow> {
        self.rows.get(&id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &ChangeLogRow> {
        self.rows.values()
    }
}

impl DiffOutcome {
    /// Rows this outcome contributes to the change store of `kind`.
    ///
    /// Initialization outcomes contribute nothing: a baseline is not a change.
    pub fn change_log_rows(&self, kind: ChangeKind) -> Vec<ChangeLogRow> {
        if self.initialization {
            return Vec::new();
        }
        match kind {
            ChangeKind::New => self
                .new
                .iter()
                .map(|entry| ChangeLogRow {
                    record: entry.clone().into_record(entry.last_seen_at),
                    previous: None,
                })
                .collect(),
            ChangeKind::Changed => self.changed.iter().map(ChangeLogRow::from_changed).collect(),
        }
    }
}

/// Merges `incoming` into the stored log; the incoming row replaces any stored
/// row with the same id. A missing store becomes exactly the incoming set.
pub fn merge_change_log(
    existing: Option<ChangeLog>,
    kind: ChangeKind,
    incoming: impl IntoIterator<Item = ChangeLogRow>,
) -> ChangeLog {
    let mut log = existing.unwrap_or_else(|| ChangeLog::new(kind));
    debug_assert_eq!(log.kind, kind, "merging rows into a store of another kind");
    for row in incoming {
        log.rows.insert(row.id(), row);
    }
    log
}

/// Folds a snapshot into the cumulative table.
///
/// Observed ids take every mutable field from the snapshot but keep the stored
/// `first_seen_at`; unseen ids get `first_seen_at = last_seen_at`. Rows missing
/// from the snapshot are carried over untouched.
pub fn merge_total_table(
    existing: Option<CumulativeTable>,
    snapshot: &Snapshot,
) -> CumulativeTable {
    let mut table = existing.unwrap_or_default();
    for entry in snapshot.values() {
        let first_seen_at = table
            .get(entry.id)
            .map(|stored| stored.first_seen_at)
            .unwrap_or(entry.last_seen_at);
        table.upsert(entry.clone().into_record(first_seen_at));
    }
    table
}
