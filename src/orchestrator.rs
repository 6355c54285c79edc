// ABOUTME: SyncOrchestrator - runs prepare, reconcile and retry stages over all tables
// ABOUTME: Tables run in parallel with bounded concurrency; one failure never stops the rest

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::db::{ConnectionFactory, TableQuery, TableRef};
use crate::error::{ErrorKind, SyncError, TableError};
use crate::evaluator::ChangeVolumeReport;
use crate::reconcile::{ReconcileJob, ReconcileOutcome, ReconcilePhase, Reconciler, SyncMode};
use crate::registry::{TableRegistry, TableStatus, TableSyncState};
use crate::schema::{copyable_fields, find_field, SchemaCatalog};
use crate::strategy::TableDirective;
use crate::timestamps::{TimestampStore, TokenSide};

/// Per-run overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only sync these tables (case-insensitive). Empty means all.
    pub only_tables: Vec<String>,
    /// Force a full reload of every table.
    pub force_full_reload: bool,
}

impl RunOptions {
    fn selects(&self, key: &str) -> bool {
        self.only_tables.is_empty()
            || self
                .only_tables
                .iter()
                .any(|table| table.trim().eq_ignore_ascii_case(key))
    }
}

/// Success and failure counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl StageReport {
    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Final state of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub status: TableStatus,
    pub mode: Option<SyncMode>,
    pub rows_fetched: u64,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub elapsed_secs: f64,
    pub attempts: u32,
    pub report: Option<ChangeVolumeReport>,
    pub error: Option<TableError>,
}

impl From<&TableSyncState> for TableOutcome {
    fn from(state: &TableSyncState) -> Self {
        Self {
            table: state.key.clone(),
            status: state.status,
            mode: state.mode,
            rows_fetched: state.rows_fetched,
            rows_inserted: state.rows_inserted,
            rows_deleted: state.rows_deleted,
            elapsed_secs: state.elapsed_secs,
            attempts: state.attempts,
            report: state.report.clone(),
            error: state.error.clone(),
        }
    }
}

/// Everything a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub prepare: StageReport,
    pub reconcile: StageReport,
    pub retry: StageReport,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub cancelled: bool,
    pub tables: Vec<TableOutcome>,
}

impl RunSummary {
    pub fn committed(&self) -> usize {
        self.count(TableStatus::Committed)
    }

    pub fn failed(&self) -> usize {
        self.count(TableStatus::Error)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, status: TableStatus) -> usize {
        self.tables.iter().filter(|t| t.status == status).count()
    }
}

/// Drives the per-table pipeline across the whole table set.
///
/// A run has three ordered stages:
/// 1. Prepare: resolve every directive against both catalogs and register it
/// 2. Reconcile: evaluate and reconcile pending tables in parallel
/// 3. Retry: re-attempt tables that failed with a transient database error
///
/// Stored tokens are saved once at the end, or after every committed table
/// when `persist_after_each_table` is set.
pub struct SyncOrchestrator<F: ConnectionFactory> {
    config: SyncConfig,
    factory: F,
    store: Arc<TimestampStore>,
    registry: Arc<TableRegistry>,
    cancel: CancellationToken,
    reconciler: Reconciler,
    save_lock: Mutex<()>,
}

impl<F: ConnectionFactory> SyncOrchestrator<F> {
    pub fn new(config: SyncConfig, factory: F, store: Arc<TimestampStore>) -> Self {
        Self::with_cancellation(config, factory, store, CancellationToken::new())
    }

    pub fn with_cancellation(
        config: SyncConfig,
        factory: F,
        store: Arc<TimestampStore>,
        cancel: CancellationToken,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::new(Semaphore::new(config.max_parallel_fetch.max(1))),
            Arc::new(Semaphore::new(config.max_parallel_reconcile.max(1))),
            cancel.clone(),
            config.thresholds(),
        );
        Self {
            config,
            factory,
            store,
            registry: Arc::new(TableRegistry::new()),
            cancel,
            reconciler,
            save_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> Arc<TableRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> Arc<TimestampStore> {
        Arc::clone(&self.store)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run all three stages once.
    pub async fn run<S, T>(
        &self,
        directives: &[TableDirective],
        source_catalog: &S,
        target_catalog: &T,
        options: &RunOptions,
    ) -> Result<RunSummary>
    where
        S: SchemaCatalog,
        T: SchemaCatalog,
    {
        let started_at = chrono::Utc::now();

        let prepare = self.prepare(directives, source_catalog, target_catalog, options);
        tracing::info!(
            "Prepared {} tables ({} rejected)",
            prepare.succeeded,
            prepare.failed
        );

        let reconcile = self.reconcile_pending().await;
        tracing::info!(
            "Reconcile stage: {} committed, {} failed",
            reconcile.succeeded,
            reconcile.failed
        );

        let retry = if self.cancel.is_cancelled() {
            tracing::warn!("Run cancelled, skipping retry stage");
            StageReport::default()
        } else {
            let retry = self.retry_failed().await;
            if retry.succeeded + retry.failed > 0 {
                tracing::info!(
                    "Retry stage: {} recovered, {} still failing",
                    retry.succeeded,
                    retry.failed
                );
            }
            retry
        };

        self.save_tokens().await?;

        let snapshot = self.registry.snapshot();
        let summary = RunSummary {
            started_at,
            finished_at: chrono::Utc::now(),
            prepare,
            reconcile,
            retry,
            rows_inserted: snapshot.iter().map(|s| s.rows_inserted).sum(),
            rows_deleted: snapshot.iter().map(|s| s.rows_deleted).sum(),
            cancelled: self.cancel.is_cancelled(),
            tables: snapshot.iter().map(TableOutcome::from).collect(),
        };

        Ok(summary)
    }

    /// Register every selected directive and detect what each table supports.
    ///
    /// Tables that cannot be synced at all are registered straight into
    /// `Error` so they show up in the summary.
    pub fn prepare<S, T>(
        &self,
        directives: &[TableDirective],
        source_catalog: &S,
        target_catalog: &T,
        options: &RunOptions,
    ) -> StageReport
    where
        S: SchemaCatalog,
        T: SchemaCatalog,
    {
        let mut report = StageReport::default();

        for directive in directives {
            let key = directive.key();
            if !options.selects(&key) {
                tracing::debug!("Skipping {} (not selected)", directive.table);
                continue;
            }
            for warning in &directive.warnings {
                tracing::warn!("{}", warning);
            }

            let mut strategy = directive.strategy.clone();
            if options.force_full_reload {
                strategy = strategy.with_forced_full_reload();
            }
            let record_count = strategy.effective_record_count(self.config.default_record_count);

            let source_id = source_catalog.table_id(&directive.table);
            let target_id = target_catalog.table_id(&directive.table);
            let source_table = self.table_ref(source_catalog, source_id, &directive.table);
            let target_table = self.table_ref(target_catalog, target_id, &directive.table);

            let mut state =
                TableSyncState::new(key.clone(), source_table, target_table, strategy, record_count);
            state.source_id = source_id;
            state.target_id = target_id;
            state.stored_source_token = self.store.get(&key, TokenSide::Source);
            state.stored_target_token = self.store.get(&key, TokenSide::Target);

            let problem = match (source_id, target_id) {
                (None, _) => Some(TableError::new(
                    ErrorKind::FatalConfiguration,
                    format!("{} not found in source schema {}", directive.table, self.config.schema),
                )),
                (_, None) => Some(TableError::new(
                    ErrorKind::FatalConfiguration,
                    format!("{} not found in target schema {}", directive.table, self.config.schema),
                )),
                (Some(source_id), Some(target_id)) => {
                    self.detect_capability(&mut state, source_catalog, source_id, target_catalog, target_id)
                }
            };

            self.registry.insert(state);

            match problem {
                None => report.record(true),
                Some(error) => {
                    tracing::error!("{}: {}", key, error);
                    if let Err(e) = self.registry.fail(&key, error) {
                        tracing::error!("{}: {}", key, e);
                    }
                    report.record(false);
                }
            }
        }

        report
    }

    fn table_ref<C: SchemaCatalog>(&self, catalog: &C, id: Option<u32>, fallback: &str) -> TableRef {
        let fields = id.and_then(|id| catalog.fields(id)).unwrap_or(&[]);
        TableRef {
            schema: self.config.schema.clone(),
            name: id
                .and_then(|id| catalog.table_name(id))
                .unwrap_or(fallback)
                .to_string(),
            id_column: find_field(fields, &self.config.id_column)
                .unwrap_or(self.config.id_column.as_str())
                .to_string(),
            version_column: find_field(fields, &self.config.version_column).map(str::to_string),
        }
    }

    fn detect_capability<S, T>(
        &self,
        state: &mut TableSyncState,
        source_catalog: &S,
        source_id: u32,
        target_catalog: &T,
        target_id: u32,
    ) -> Option<TableError>
    where
        S: SchemaCatalog,
        T: SchemaCatalog,
    {
        let source_fields = source_catalog.fields(source_id).unwrap_or(&[]);
        let target_fields = target_catalog.fields(target_id).unwrap_or(&[]);

        for (side, fields) in [("source", source_fields), ("target", target_fields)] {
            if find_field(fields, &self.config.id_column).is_none() {
                return Some(TableError::new(
                    ErrorKind::CapabilityMismatch,
                    format!("{} has no {} column in the {}", state.key, self.config.id_column, side),
                ));
            }
        }

        state.copyable_fields = copyable_fields(
            source_fields,
            target_fields,
            &self.config.excluded_fields,
            Some(self.config.version_column.as_str()),
        );
        if state.copyable_fields.is_empty() {
            return Some(TableError::new(
                ErrorKind::CapabilityMismatch,
                format!("{} has no columns in common", state.key),
            ));
        }

        state.supports_optimized_mode = state.has_version_column()
            && state.stored_source_token.is_some()
            && state.stored_target_token.is_some();

        tracing::debug!(
            "{}: {} copyable fields, optimized mode {}",
            state.key,
            state.copyable_fields.len(),
            state.supports_optimized_mode
        );
        None
    }

    /// Evaluate and reconcile every `Pending` table.
    pub async fn reconcile_pending(&self) -> StageReport {
        let keys = self.registry.keys_with_status(TableStatus::Pending);
        self.run_tables(keys, false).await
    }

    /// Re-attempt every table whose failure is retryable.
    pub async fn retry_failed(&self) -> StageReport {
        let keys: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|state| {
                state.status == TableStatus::Error
                    && state.error.as_ref().is_some_and(TableError::is_retryable)
            })
            .map(|state| state.key)
            .collect();

        let mut ready = Vec::with_capacity(keys.len());
        for key in keys {
            match self.registry.transition(&key, TableStatus::Reconciling) {
                Ok(()) => {
                    tracing::info!("Retrying {}", key);
                    ready.push(key);
                }
                Err(e) => tracing::error!("{}", e),
            }
        }

        self.run_tables(ready, true).await
    }

    async fn run_tables(&self, keys: Vec<String>, retry: bool) -> StageReport {
        let results: Vec<bool> = stream::iter(keys)
            .map(|key| async move { self.sync_table(&key, retry).await })
            .buffer_unordered(self.config.max_parallel_tables.max(1))
            .collect()
            .await;

        let mut report = StageReport::default();
        for ok in results {
            report.record(ok);
        }
        report
    }

    /// Run one table's pipeline and record the result. Returns true when the
    /// table committed.
    async fn sync_table(&self, key: &str, retry: bool) -> bool {
        let started = Instant::now();
        self.registry.update(key, |state| {
            state.attempts += 1;
            state.error = None;
        });

        match self.table_pipeline(key, retry).await {
            Ok(outcome) => {
                self.commit_tokens(key, &outcome).await;
                let elapsed = started.elapsed().as_secs_f64();
                tracing::info!(
                    "{}: {} sync committed ({} inserted, {} deleted) in {:.1}s",
                    key,
                    outcome.mode,
                    outcome.rows_inserted,
                    outcome.rows_deleted,
                    elapsed
                );
                match self.registry.complete(key, &outcome, elapsed) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!("{}", e);
                        false
                    }
                }
            }
            Err(err) => {
                let error = TableError::from_anyhow(&err);
                tracing::error!("{}: sync failed: {:?}", key, err);
                self.registry.update(key, |state| {
                    state.elapsed_secs = started.elapsed().as_secs_f64();
                });
                if let Err(e) = self.registry.fail(key, error) {
                    tracing::error!("{}", e);
                }
                false
            }
        }
    }

    async fn table_pipeline(&self, key: &str, retry: bool) -> Result<ReconcileOutcome> {
        let state = self
            .registry
            .get(key)
            .ok_or_else(|| SyncError::FatalConfiguration(format!("Unknown table {}", key)))?;

        if !retry {
            self.registry.transition(key, TableStatus::Evaluating)?;
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }

        let source = self
            .factory
            .connect_source()
            .await
            .with_context(|| format!("{}: failed to open source connection", key))?;
        let mut target = self
            .factory
            .connect_target()
            .await
            .with_context(|| format!("{}: failed to open target connection", key))?;

        let job = ReconcileJob {
            query: TableQuery {
                table: state.source_table.clone(),
                strategy: state.strategy.clone(),
                record_count: state.record_count,
            },
            target_table: state.target_table.clone(),
            fields: state.copyable_fields.clone(),
            stored_source: state.stored_source_token,
            stored_target: state.stored_target_token,
            optimized: state.supports_optimized_mode,
        };
        let on_phase = |phase: ReconcilePhase| self.registry.set_phase(key, phase);

        let plan = self.reconciler.plan(&source, &target, &job, &on_phase).await?;
        self.registry.update(key, |state| {
            state.mode = Some(plan.mode);
            state.report = plan.report.clone();
        });

        if !retry {
            self.registry.transition(key, TableStatus::Reconciling)?;
        }

        self.reconciler
            .execute(&source, &mut target, &job, &plan, &on_phase)
            .await
    }

    /// Advance stored tokens after a committed table.
    ///
    /// A commit without tokens on both sides clears them so the next run
    /// reloads instead of trusting stale values.
    async fn commit_tokens(&self, key: &str, outcome: &ReconcileOutcome) {
        match (outcome.source_token, outcome.target_token) {
            (Some(source), Some(target)) => self.store.set(key, source, target),
            _ => {
                if self.store.clear(key) {
                    tracing::debug!("{}: cleared stored tokens", key);
                }
            }
        }

        if self.config.persist_after_each_table {
            if let Err(e) = self.save_tokens().await {
                tracing::error!("{}: failed to persist stored tokens: {:?}", key, e);
            }
        }
    }

    async fn save_tokens(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        self.store
            .save(&self.config.state_dir)
            .await
            .context("Failed to save stored tokens")
    }
}
