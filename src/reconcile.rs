// ABOUTME: Reconciliation engine - truncate reload or incremental delete plus gap fill
// ABOUTME: Each table runs in one target transaction that rolls back on any failure

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::db::{
    ControlScan, FetchFilter, SourceConnection, SourceRow, TableQuery, TableRef, TargetConnection,
};
use crate::error::SyncError;
use crate::evaluator::{self, ChangeVolumeReport, Thresholds};
use crate::token::{min_token, VersionToken};

/// Where a table's pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcilePhase {
    Idle,
    Evaluating,
    TruncateReload,
    IncrementalDelete,
    IncrementalFetch,
    IncrementalInsert,
    Committed,
    Failed,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReconcilePhase::Idle => "idle",
            ReconcilePhase::Evaluating => "evaluating",
            ReconcilePhase::TruncateReload => "reloading",
            ReconcilePhase::IncrementalDelete => "deleting",
            ReconcilePhase::IncrementalFetch => "fetching",
            ReconcilePhase::IncrementalInsert => "inserting",
            ReconcilePhase::Committed => "committed",
            ReconcilePhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    Truncate,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Truncate => f.write_str("truncate"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Everything the engine needs to reconcile one table.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    /// Source table, strategy and effective record count.
    pub query: TableQuery,
    pub target_table: TableRef,
    pub fields: Vec<String>,
    pub stored_source: Option<VersionToken>,
    pub stored_target: Option<VersionToken>,
    /// Version columns on both sides and both stored tokens present.
    pub optimized: bool,
}

impl ReconcileJob {
    pub fn force_full_reload(&self) -> bool {
        self.query.strategy.force_full_reload()
    }
}

/// Mode decision for one table, with the evidence behind it.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub mode: SyncMode,
    pub scan: Option<ControlScan>,
    pub report: Option<ChangeVolumeReport>,
}

/// Result of a committed reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub mode: SyncMode,
    pub rows_fetched: u64,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub source_token: Option<VersionToken>,
    pub target_token: Option<VersionToken>,
}

impl ReconcileOutcome {
    fn empty(mode: SyncMode) -> Self {
        Self {
            mode,
            rows_fetched: 0,
            rows_inserted: 0,
            rows_deleted: 0,
            source_token: None,
            target_token: None,
        }
    }
}

/// Runs the two reconciliation state machines.
///
/// Source reads go through `fetch_gate` and target transactions through
/// `reconcile_gate`. A fetch permit is never held while waiting for a
/// reconcile permit.
#[derive(Debug, Clone)]
pub struct Reconciler {
    fetch_gate: Arc<Semaphore>,
    reconcile_gate: Arc<Semaphore>,
    cancel: CancellationToken,
    thresholds: Thresholds,
}

impl Reconciler {
    pub fn new(
        fetch_gate: Arc<Semaphore>,
        reconcile_gate: Arc<Semaphore>,
        cancel: CancellationToken,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            fetch_gate,
            reconcile_gate,
            cancel,
            thresholds,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }
        Ok(())
    }

    /// Decide between truncate and incremental mode.
    ///
    /// Forced reloads and tables without optimized-mode capability skip the
    /// control scan entirely.
    pub async fn plan<S: SourceConnection, T: TargetConnection>(
        &self,
        source: &S,
        target: &T,
        job: &ReconcileJob,
        on_phase: &dyn Fn(ReconcilePhase),
    ) -> Result<ReconcilePlan> {
        self.check_cancelled()?;
        on_phase(ReconcilePhase::Evaluating);

        let name = job.query.table.display_name();
        if job.force_full_reload() {
            tracing::info!("{}: full reload requested", name);
            return Ok(ReconcilePlan {
                mode: SyncMode::Truncate,
                scan: None,
                report: None,
            });
        }
        if !job.optimized {
            tracing::info!(
                "{}: no stored tokens or version column on both sides, reloading",
                name
            );
            return Ok(ReconcilePlan {
                mode: SyncMode::Truncate,
                scan: None,
                report: None,
            });
        }

        let scan = {
            let _permit = self.fetch_gate.acquire().await.context("Fetch gate closed")?;
            source.control_scan(&job.query).await?
        };

        let report = evaluator::evaluate(
            target,
            &job.target_table,
            &scan,
            job.stored_source,
            job.stored_target,
            self.thresholds,
        )
        .await?;

        let mode = if report.use_truncate {
            tracing::info!(
                "{}: {:.1}% changed, {:.1}% excess - reloading",
                name,
                report.change_percent,
                report.excess_percent
            );
            SyncMode::Truncate
        } else {
            SyncMode::Incremental
        };

        Ok(ReconcilePlan {
            mode,
            scan: Some(scan),
            report: Some(report),
        })
    }

    /// Execute a plan inside one target transaction.
    pub async fn execute<S: SourceConnection, T: TargetConnection>(
        &self,
        source: &S,
        target: &mut T,
        job: &ReconcileJob,
        plan: &ReconcilePlan,
        on_phase: &dyn Fn(ReconcilePhase),
    ) -> Result<ReconcileOutcome> {
        self.check_cancelled()?;
        match (plan.mode, &plan.scan) {
            (SyncMode::Incremental, Some(scan)) => {
                self.incremental(source, target, job, scan, on_phase).await
            }
            _ => self.truncate_reload(source, target, job, on_phase).await,
        }
    }

    /// Full reload of the strategy's row population.
    pub async fn truncate_reload<S: SourceConnection, T: TargetConnection>(
        &self,
        source: &S,
        target: &mut T,
        job: &ReconcileJob,
        on_phase: &dyn Fn(ReconcilePhase),
    ) -> Result<ReconcileOutcome> {
        on_phase(ReconcilePhase::TruncateReload);

        let rows = {
            let _permit = self.fetch_gate.acquire().await.context("Fetch gate closed")?;
            source.fetch_rows(&job.query, &job.fields, None).await?
        };
        self.check_cancelled()?;

        let _permit = self
            .reconcile_gate
            .acquire()
            .await
            .context("Reconcile gate closed")?;

        target.begin().await?;
        let result = self.reload_in_transaction(target, job, &rows).await;

        let target_token = match result {
            Ok(token) => token,
            Err(err) => {
                if let Err(e) = target.set_triggers_enabled(&job.target_table, true).await {
                    tracing::warn!(
                        "Failed to re-enable triggers on {}: {:#}",
                        job.target_table.display_name(),
                        e
                    );
                }
                rollback_quietly(target).await;
                return Err(err);
            }
        };

        self.commit_unless_cancelled(target).await?;

        let mut outcome = ReconcileOutcome::empty(SyncMode::Truncate);
        outcome.rows_fetched = rows.len() as u64;
        outcome.rows_inserted = rows.len() as u64;
        outcome.source_token = rows.iter().filter_map(|r| r.token).max();
        outcome.target_token = target_token;
        Ok(outcome)
    }

    async fn reload_in_transaction<T: TargetConnection>(
        &self,
        target: &mut T,
        job: &ReconcileJob,
        rows: &[SourceRow],
    ) -> Result<Option<VersionToken>> {
        let table = &job.target_table;
        target.set_triggers_enabled(table, false).await?;
        target.truncate(table).await?;
        let inserted = target.bulk_load(table, &job.fields, rows).await?;
        target.set_triggers_enabled(table, true).await?;
        target.reseed_identity(table).await?;

        tracing::debug!("{}: reloaded {} rows", table.display_name(), inserted);

        if table.version_column.is_some() {
            target.max_token(table).await
        } else {
            Ok(None)
        }
    }

    /// Three-step delete, then insert of exactly the rows the target lacks.
    pub async fn incremental<S: SourceConnection, T: TargetConnection>(
        &self,
        source: &S,
        target: &mut T,
        job: &ReconcileJob,
        scan: &ControlScan,
        on_phase: &dyn Fn(ReconcilePhase),
    ) -> Result<ReconcileOutcome> {
        let _permit = self
            .reconcile_gate
            .acquire()
            .await
            .context("Reconcile gate closed")?;

        target.begin().await?;
        match self
            .incremental_in_transaction(source, target, job, scan, on_phase)
            .await
        {
            Ok(outcome) => {
                self.commit_unless_cancelled(target).await?;
                Ok(outcome)
            }
            Err(err) => {
                rollback_quietly(target).await;
                Err(err)
            }
        }
    }

    async fn incremental_in_transaction<S: SourceConnection, T: TargetConnection>(
        &self,
        source: &S,
        target: &mut T,
        job: &ReconcileJob,
        scan: &ControlScan,
        on_phase: &dyn Fn(ReconcilePhase),
    ) -> Result<ReconcileOutcome> {
        let table = &job.target_table;
        let mut outcome = ReconcileOutcome::empty(SyncMode::Incremental);

        on_phase(ReconcilePhase::IncrementalDelete);
        target.stage_working_set(scan).await?;
        outcome.rows_deleted += target
            .delete_modified_in_source(table, job.stored_source)
            .await?;
        if let Some(stored_target) = job.stored_target {
            outcome.rows_deleted += target.delete_modified_in_target(table, stored_target).await?;
        }
        outcome.rows_deleted += target.delete_outside_working_set(table).await?;
        target.drop_working_set().await?;

        let present = target.row_ids(table).await?;
        let missing: HashSet<i64> = scan
            .rows()
            .iter()
            .map(|row| row.id)
            .filter(|id| !present.contains(id))
            .collect();

        if !missing.is_empty() {
            self.check_cancelled()?;
            on_phase(ReconcilePhase::IncrementalFetch);

            let filter = gap_fill_filter(scan, &missing, job.stored_source);
            let fetched = {
                let _permit = self.fetch_gate.acquire().await.context("Fetch gate closed")?;
                source
                    .fetch_rows(&job.query, &job.fields, filter.as_ref())
                    .await?
            };
            outcome.rows_fetched = fetched.len() as u64;

            let mut seen = HashSet::with_capacity(missing.len());
            let rows: Vec<SourceRow> = fetched
                .into_iter()
                .filter(|row| missing.contains(&row.id) && seen.insert(row.id))
                .collect();

            if rows.len() < missing.len() {
                tracing::warn!(
                    "{}: {} of {} missing rows were not returned by the source",
                    table.display_name(),
                    missing.len() - rows.len(),
                    missing.len()
                );
            }

            on_phase(ReconcilePhase::IncrementalInsert);
            outcome.rows_inserted = target.bulk_load(table, &job.fields, &rows).await?;
        } else {
            tracing::debug!("{}: no missing rows", table.display_name());
        }

        outcome.source_token = scan.max_token().or(job.stored_source);
        outcome.target_token = if table.version_column.is_some() {
            target.max_token(table).await?.or(job.stored_target)
        } else {
            None
        };

        Ok(outcome)
    }

    async fn commit_unless_cancelled<T: TargetConnection>(&self, target: &mut T) -> Result<()> {
        if self.cancel.is_cancelled() {
            rollback_quietly(target).await;
            return Err(SyncError::Cancelled.into());
        }
        if let Err(err) = target.commit().await {
            rollback_quietly(target).await;
            return Err(err);
        }
        Ok(())
    }
}

/// Narrowing for the gap-fill fetch.
///
/// The token floor is the lower of the oldest missing row's token and the
/// stored source token, inclusive, so the oldest missing row is returned.
/// When a missing row has no token at all the fetch is left unfiltered.
pub fn gap_fill_filter(
    scan: &ControlScan,
    missing: &HashSet<i64>,
    stored_source: Option<VersionToken>,
) -> Option<FetchFilter> {
    let mut oldest_missing: Option<VersionToken> = None;
    for row in scan.rows().iter().filter(|row| missing.contains(&row.id)) {
        match row.token {
            Some(token) => oldest_missing = min_token(oldest_missing, Some(token)),
            None => return None,
        }
    }

    let min_token = min_token(oldest_missing, stored_source)?;
    let min_id = scan.min_id()?;
    Some(FetchFilter { min_token, min_id })
}

async fn rollback_quietly<T: TargetConnection>(target: &mut T) {
    if let Err(e) = target.rollback().await {
        tracing::warn!("Rollback failed: {:#}", e);
    }
}
