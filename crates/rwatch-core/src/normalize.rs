//! Raw catalog hits → canonical snapshot entries.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SubsecRound, TimeZone, Utc};
use thiserror::Error;
use tracing::warn;

use crate::{EntityId, RawCatalogItem, Snapshot, SnapshotEntry, LICENSE_SENTINEL};

/// Timestamp layout used by the catalog wire format.
pub const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{field} is missing")]
    MissingTimestamp { field: &'static str },
    #[error("{field} {value:?} is not a catalog timestamp")]
    BadTimestamp { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    pub id: EntityId,
    pub name: String,
    pub error: NormalizeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSnapshot {
    pub captured_at: DateTime<FixedOffset>,
    pub entries: Snapshot,
    /// Earlier occurrences replaced by a later one with the same id.
    pub duplicates: usize,
    pub rejected: Vec<RejectedItem>,
}

/// Fixed display offset for a whole-hour UTC shift, e.g. `8` for UTC+08:00.
pub fn display_offset(hours: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(hours.checked_mul(3600)?)
}

/// Parses a wire timestamp, shifts it into `zone` and drops sub-second digits.
///
/// Stores keep second precision, so a fractional value would never compare
/// equal to its persisted form.
pub fn parse_wire_timestamp(value: &str, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    let parsed = match NaiveDateTime::parse_from_str(value, WIRE_TIMESTAMP_FORMAT) {
        Ok(naive) => Utc.from_utc_datetime(&naive).with_timezone(zone),
        Err(_) => DateTime::parse_from_rfc3339(value).ok()?.with_timezone(zone),
    };
    Some(parsed.trunc_subsecs(0))
}

fn required_timestamp(
    field: &'static str,
    value: Option<&str>,
    zone: &FixedOffset,
) -> Result<DateTime<FixedOffset>, NormalizeError> {
    let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
        return Err(NormalizeError::MissingTimestamp { field });
    };
    parse_wire_timestamp(raw, zone).ok_or_else(|| NormalizeError::BadTimestamp {
        field,
        value: raw.to_string(),
    })
}

fn normalize_item(
    item: RawCatalogItem,
    captured_at: DateTime<FixedOffset>,
) -> Result<SnapshotEntry, (RawCatalogItem, NormalizeError)> {
    let zone = *captured_at.offset();
    let created_at = match required_timestamp("created_at", item.created_at.as_deref(), &zone) {
        Ok(ts) => ts,
        Err(err) => return Err((item, err)),
    };
    let updated_at = match required_timestamp("updated_at", item.updated_at.as_deref(), &zone) {
        Ok(ts) => ts,
        Err(err) => return Err((item, err)),
    };
    let license = item
        .license
        .map(|license| license.key)
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| LICENSE_SENTINEL.to_string());

    Ok(SnapshotEntry {
        id: EntityId(item.id),
        name: item.full_name,
        url: item.html_url,
        license,
        metric: item.stargazers_count,
        created_at,
        updated_at,
        last_seen_at: captured_at,
    })
}

/// Builds the canonical snapshot for one category.
///
/// All timestamps end up in the offset of `captured_at`, truncated to whole
/// seconds. When an id repeats within the batch the last occurrence wins.
/// Items with unusable timestamps are skipped and reported, never fatal.
pub fn normalize_snapshot<I>(items: I, captured_at: DateTime<FixedOffset>) -> NormalizedSnapshot
where
    I: IntoIterator<Item = RawCatalogItem>,
{
    let captured_at = captured_at.trunc_subsecs(0);
    let mut entries = Snapshot::new();
    let mut duplicates = 0usize;
    let mut rejected = Vec::new();

    for item in items {
        match normalize_item(item, captured_at) {
            Ok(entry) => {
                if entries.insert(entry.id, entry).is_some() {
                    duplicates += 1;
                }
            }
            Err((item, error)) => {
                warn!(id = item.id, name = %item.full_name, %error, "skipping catalog item");
                rejected.push(RejectedItem {
                    id: EntityId(item.id),
                    name: item.full_name,
                    error,
                });
            }
        }
    }

    NormalizedSnapshot {
        captured_at,
        entries,
        duplicates,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{at, bj};
    use crate::RawLicense;

    fn raw(id: u64, name: &str, stars: i64, license: Option<&str>) -> RawCatalogItem {
        RawCatalogItem {
            id,
            full_name: name.to_string(),
            html_url: format!("https://github.com/{name}"),
            stargazers_count: stars,
            license: license.map(|key| RawLicense { key: key.to_string() }),
            created_at: Some("2025-10-11T00:00:00Z".to_string()),
            updated_at: Some("2025-10-12T16:30:00Z".to_string()),
        }
    }

    #[test]
    fn timestamps_are_shifted_into_the_display_zone() {
        let captured = at(2025, 11, 1, 9);
        let snapshot = normalize_snapshot([raw(1, "octo/a", 120, Some("mit"))], captured);
        let entry = &snapshot.entries[&EntityId(1)];

        assert_eq!(entry.created_at.to_rfc3339(), "2025-10-11T08:00:00+08:00");
        // 16:30 UTC rolls over to the next calendar day in UTC+8.
        assert_eq!(entry.updated_at.to_rfc3339(), "2025-10-13T00:30:00+08:00");
        assert_eq!(entry.last_seen_at, captured);
    }

    #[test]
    fn absent_license_maps_to_sentinel() {
        let snapshot = normalize_snapshot(
            [raw(1, "octo/a", 1, None), raw(2, "octo/b", 1, Some(""))],
            at(2025, 11, 1, 9),
        );
        assert_eq!(snapshot.entries[&EntityId(1)].license, LICENSE_SENTINEL);
        assert_eq!(snapshot.entries[&EntityId(2)].license, LICENSE_SENTINEL);
    }

    #[test]
    fn last_occurrence_of_an_id_wins() {
        let snapshot = normalize_snapshot(
            [
                raw(5, "octo/old-name", 100, Some("mit")),
                raw(6, "octo/other", 3, None),
                raw(5, "octo/new-name", 101, Some("mit")),
            ],
            at(2025, 11, 1, 9),
        );
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.entries[&EntityId(5)].name, "octo/new-name");
        assert_eq!(snapshot.entries[&EntityId(5)].metric, 101);
    }

    #[test]
    fn unusable_timestamps_are_reported_not_fatal() {
        let mut missing = raw(1, "octo/missing", 1, None);
        missing.updated_at = None;
        let mut garbled = raw(2, "octo/garbled", 1, None);
        garbled.created_at = Some("yesterday".to_string());

        let snapshot = normalize_snapshot(
            [missing, garbled, raw(3, "octo/fine", 1, None)],
            at(2025, 11, 1, 9),
        );

        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.rejected.len(), 2);
        assert_eq!(
            snapshot.rejected[0].error,
            NormalizeError::MissingTimestamp { field: "updated_at" }
        );
        assert!(matches!(
            snapshot.rejected[1].error,
            NormalizeError::BadTimestamp { field: "created_at", .. }
        ));
    }

    #[test]
    fn capture_time_is_truncated_to_seconds() {
        let captured = at(2025, 11, 1, 9) + chrono::Duration::milliseconds(750);
        let snapshot = normalize_snapshot([raw(1, "octo/a", 1, None)], captured);
        assert_eq!(snapshot.captured_at, at(2025, 11, 1, 9));
        assert_eq!(snapshot.entries[&EntityId(1)].last_seen_at, at(2025, 11, 1, 9));
    }

    #[test]
    fn rfc3339_with_offset_is_accepted() {
        let parsed = parse_wire_timestamp("2025-10-11T08:00:00+08:00", &bj()).unwrap();
        assert_eq!(parsed, at(2025, 10, 11, 8));
        assert!(display_offset(8).is_some());
        assert!(display_offset(30).is_none());
    }

    #[test]
    fn fractional_seconds_are_dropped() {
        let parsed = parse_wire_timestamp("2025-10-12T00:00:00.500Z", &bj()).unwrap();
        assert_eq!(parsed, at(2025, 10, 12, 8));
        assert_eq!(parsed.timestamp_subsec_nanos(), 0);
    }
}
