//! Core domain model and snapshot reconciliation for RWATCH.
//!
//! The crate is pure and synchronous: it turns raw catalog hits into a
//! canonical [`Snapshot`], classifies that snapshot against the persisted
//! [`CumulativeTable`], and folds the result into change logs and the next
//! cumulative table. Persistence and network I/O live in other crates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

pub mod diff;
pub mod merge;
pub mod normalize;

pub use diff::{diff_snapshot, ChangedEntity, DiffOutcome, FieldDelta};
pub use merge::{merge_change_log, merge_total_table, ChangeLog, ChangeLogRow, PreviousValues};
pub use normalize::{
    display_offset, normalize_snapshot, parse_wire_timestamp, NormalizeError, NormalizedSnapshot,
    RejectedItem,
};

pub const CRATE_NAME: &str = "rwatch-core";

/// Value stored for entities whose catalog entry carries no license.
pub const LICENSE_SENTINEL: &str = "None";

/// Stable identifier assigned by the upstream catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// License block of a repository search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLicense {
    pub key: String,
}

/// Repository search hit as delivered by the catalog, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCatalogItem {
    pub id: u64,
    pub full_name: String,
    pub html_url: String,
    pub stargazers_count: i64,
    #[serde(default)]
    pub license: Option<RawLicense>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// One entity as observed in a single snapshot.
///
/// `first_seen_at` is intentionally absent: it is assigned once, by
/// [`merge_total_table`], and never derived from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: EntityId,
    pub name: String,
    pub url: String,
    pub license: String,
    pub metric: i64,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
    pub last_seen_at: DateTime<FixedOffset>,
}

impl SnapshotEntry {
    pub fn into_record(self, first_seen_at: DateTime<FixedOffset>) -> EntityRecord {
        EntityRecord {
            id: self.id,
            name: self.name,
            url: self.url,
            license: self.license,
            metric: self.metric,
            created_at: self.created_at,
            updated_at: self.updated_at,
            first_seen_at,
            last_seen_at: self.last_seen_at,
        }
    }
}

/// Persisted entity row with local provenance timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub name: String,
    pub url: String,
    pub license: String,
    pub metric: i64,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
    pub first_seen_at: DateTime<FixedOffset>,
    pub last_seen_at: DateTime<FixedOffset>,
}

/// Canonical snapshot keyed by identity.
pub type Snapshot = BTreeMap<EntityId, SnapshotEntry>;

/// Rejected when a table is built from rows that repeat an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("duplicate entity id {0}")]
pub struct DuplicateEntity(pub EntityId);

/// All-time record set of one category, at most one row per [`EntityId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CumulativeTable {
    records: BTreeMap<EntityId, EntityRecord>,
}

impl CumulativeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_from_records(
        records: impl IntoIterator<Item = EntityRecord>,
    ) -> Result<Self, DuplicateEntity> {
        let mut table = Self::new();
        for record in records {
            let id = record.id;
            if table.records.insert(id, record).is_some() {
                return Err(DuplicateEntity(id));
            }
        }
        Ok(table)
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows in ascending identity order.
    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    pub(crate) fn upsert(&mut self, record: EntityRecord) {
        self.records.insert(record.id, record);
    }
}

/// Classification kinds that are written to change stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Changed,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 2] = [ChangeKind::New, ChangeKind::Changed];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Changed => "changed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar day (in the reference timezone) that scopes a change store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub const FORMAT: &'static str = "%Y%m%d";

    pub fn of(captured_at: &DateTime<FixedOffset>) -> Self {
        Self(captured_at.date_naive())
    }

    pub fn parse(value: &str) -> Option<Self> {
        NaiveDate::parse_from_str(value.trim(), Self::FORMAT).ok().map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}
