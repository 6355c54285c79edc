// ABOUTME: Change volume evaluator - sizes a table's delta against stored tokens
// ABOUTME: Decides between a full truncate reload and an incremental pass

use anyhow::{Context, Result};
use serde::Serialize;

use crate::db::{ControlScan, TableRef, TargetConnection};
use crate::token::{is_newer, VersionToken};

/// Percentages above which a full reload is cheaper than a delta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Changed rows on both sides as a share of the control population.
    pub change_percent: f64,
    /// Target rows beyond the control population as a share of it.
    pub excess_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            change_percent: 40.0,
            excess_percent: 40.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeVolumeReport {
    pub source_changed: u64,
    pub target_changed: u64,
    pub target_rows: u64,
    pub control_rows: u64,
    pub change_percent: f64,
    pub excess_percent: f64,
    pub use_truncate: bool,
}

/// Rows in the control scan newer than the stored source token.
pub fn count_source_changed(scan: &ControlScan, stored_source: Option<VersionToken>) -> u64 {
    scan.rows()
        .iter()
        .filter(|row| is_newer(row.token, stored_source))
        .count() as u64
}

/// Pure decision once all counts are known.
///
/// An empty control population is reported as 0% on both measures and never
/// forces a reload.
pub fn assess(
    source_changed: u64,
    target_changed: u64,
    target_rows: u64,
    control_rows: u64,
    thresholds: Thresholds,
) -> ChangeVolumeReport {
    let (change_percent, excess_percent) = if control_rows == 0 {
        (0.0, 0.0)
    } else {
        let total = control_rows as f64;
        let changed = source_changed.saturating_add(target_changed) as f64;
        let excess = target_rows.saturating_sub(control_rows) as f64;
        (changed / total * 100.0, excess / total * 100.0)
    };

    let use_truncate = change_percent > thresholds.change_percent
        || excess_percent > thresholds.excess_percent;

    ChangeVolumeReport {
        source_changed,
        target_changed,
        target_rows,
        control_rows,
        change_percent,
        excess_percent,
        use_truncate,
    }
}

/// Measure a table's change volume.
///
/// `scan` is the source control scan; the target side is measured with two
/// aggregate queries.
pub async fn evaluate<T: TargetConnection>(
    target: &T,
    table: &TableRef,
    scan: &ControlScan,
    stored_source: Option<VersionToken>,
    stored_target: Option<VersionToken>,
    thresholds: Thresholds,
) -> Result<ChangeVolumeReport> {
    let source_changed = count_source_changed(scan, stored_source);
    let target_changed = target
        .count_changed_since(table, stored_target)
        .await
        .with_context(|| format!("Failed to measure target changes in {}", table.display_name()))?;
    let target_rows = target
        .count_rows(table)
        .await
        .with_context(|| format!("Failed to count target rows in {}", table.display_name()))?;

    let report = assess(
        source_changed,
        target_changed,
        target_rows,
        scan.len() as u64,
        thresholds,
    );

    tracing::debug!(
        "{}: {} source / {} target changed of {} ({:.1}%), {} target rows ({:.1}% excess)",
        table.display_name(),
        report.source_changed,
        report.target_changed,
        report.control_rows,
        report.change_percent,
        report.target_rows,
        report.excess_percent
    );

    Ok(report)
}
