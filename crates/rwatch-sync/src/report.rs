use std::fmt::Write as _;

use anyhow::{Context, Result};
use rwatch_core::{ChangeKind, ChangeLog, ChangeLogRow, DayKey};
use rwatch_storage::TableStore;

use crate::CategoryRegistry;

const STAMP: &str = "%Y-%m-%d %H:%M:%S";

/// Markdown summary of one day's change stores across every enabled category.
pub async fn report_daily_markdown(
    store: &TableStore,
    registry: &CategoryRegistry,
    day: DayKey,
) -> Result<String> {
    let mut out = format!("# Repository Watch daily report {day}\n");
    for category in registry.enabled() {
        let label = &category.label;
        let new = store
            .load_change_log(label, ChangeKind::New, day)
            .await
            .with_context(|| format!("loading new entries of {label}"))?;
        let changed = store
            .load_change_log(label, ChangeKind::Changed, day)
            .await
            .with_context(|| format!("loading changed entries of {label}"))?;
        let total = store
            .load_total(label)
            .await
            .with_context(|| format!("loading cumulative table of {label}"))?;

        let _ = write!(
            out,
            "\n## {}\n\n- New: {}\n- Changed: {}\n- Cumulative: {}\n",
            category.display_name,
            new.as_ref().map_or(0, ChangeLog::len),
            changed.as_ref().map_or(0, ChangeLog::len),
            total.as_ref().map_or(0, |t| t.len()),
        );

        let new_rows = sorted_rows(new.as_ref());
        let changed_rows = sorted_rows(changed.as_ref());
        if new_rows.is_empty() && changed_rows.is_empty() {
            out.push_str("\n_No changes recorded._\n");
            continue;
        }
        if !new_rows.is_empty() {
            out.push_str("\n### New\n\n| Name | Metric | License | First seen |\n|---|---|---|---|\n");
            for row in new_rows {
                let r = &row.record;
                let _ = writeln!(
                    out,
                    "| [{}]({}) | {} | {} | {} |",
                    r.name,
                    r.url,
                    r.metric,
                    r.license,
                    r.first_seen_at.format(STAMP)
                );
            }
        }
        if !changed_rows.is_empty() {
            out.push_str("\n### Changed\n\n| Name | Metric | Delta |\n|---|---|---|\n");
            for row in changed_rows {
                let delta = row.previous.as_ref().map_or("", |p| p.delta.as_str());
                let _ = writeln!(
                    out,
                    "| [{}]({}) | {} | {} |",
                    row.record.name, row.record.url, row.record.metric, delta
                );
            }
        }
    }
    Ok(out)
}

fn sorted_rows(log: Option<&ChangeLog>) -> Vec<&ChangeLogRow> {
    let mut rows = log.map(|l| l.rows().collect::<Vec<_>>()).unwrap_or_default();
    rows.sort_by(|a, b| b.record.metric.cmp(&a.record.metric).then(a.id().cmp(&b.id())));
    rows
}
