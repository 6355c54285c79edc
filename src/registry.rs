// ABOUTME: Table registry - per-run sync state for every table, shared across workers
// ABOUTME: Status changes go through validated transitions; readers take snapshots

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::db::TableRef;
use crate::error::{SyncError, TableError};
use crate::evaluator::ChangeVolumeReport;
use crate::reconcile::{ReconcileOutcome, ReconcilePhase, SyncMode};
use crate::strategy::CopyStrategy;
use crate::token::VersionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TableStatus {
    Pending,
    Evaluating,
    Reconciling,
    Committed,
    Error,
}

impl TableStatus {
    /// Statuses only move forward, except a failed table re-entering
    /// reconciliation on retry.
    pub fn can_transition_to(self, next: TableStatus) -> bool {
        use TableStatus::*;
        matches!(
            (self, next),
            (Pending, Evaluating)
                | (Evaluating, Reconciling)
                | (Reconciling, Committed)
                | (Pending, Error)
                | (Evaluating, Error)
                | (Reconciling, Error)
                | (Error, Reconciling)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TableStatus::Committed | TableStatus::Error)
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TableStatus::Pending => "pending",
            TableStatus::Evaluating => "evaluating",
            TableStatus::Reconciling => "reconciling",
            TableStatus::Committed => "committed",
            TableStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// One table's state for the current run.
#[derive(Debug, Clone)]
pub struct TableSyncState {
    /// Upper-cased lookup key.
    pub key: String,
    pub source_table: TableRef,
    pub target_table: TableRef,
    pub source_id: Option<u32>,
    pub target_id: Option<u32>,
    pub strategy: CopyStrategy,
    pub record_count: u64,
    pub supports_optimized_mode: bool,
    pub stored_source_token: Option<VersionToken>,
    pub stored_target_token: Option<VersionToken>,
    pub copyable_fields: Vec<String>,
    pub status: TableStatus,
    pub phase: ReconcilePhase,
    pub mode: Option<SyncMode>,
    pub report: Option<ChangeVolumeReport>,
    pub rows_fetched: u64,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub elapsed_secs: f64,
    pub error: Option<TableError>,
    pub attempts: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TableSyncState {
    pub fn new(
        key: impl Into<String>,
        source_table: TableRef,
        target_table: TableRef,
        strategy: CopyStrategy,
        record_count: u64,
    ) -> Self {
        Self {
            key: key.into(),
            source_table,
            target_table,
            source_id: None,
            target_id: None,
            strategy,
            record_count,
            supports_optimized_mode: false,
            stored_source_token: None,
            stored_target_token: None,
            copyable_fields: Vec::new(),
            status: TableStatus::Pending,
            phase: ReconcilePhase::Idle,
            mode: None,
            report: None,
            rows_fetched: 0,
            rows_inserted: 0,
            rows_deleted: 0,
            elapsed_secs: 0.0,
            error: None,
            attempts: 0,
            updated_at: chrono::Utc::now(),
        }
    }

    pub fn has_version_column(&self) -> bool {
        self.source_table.version_column.is_some() && self.target_table.version_column.is_some()
    }
}

/// Tally of registry entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub evaluating: usize,
    pub reconciling: usize,
    pub committed: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.evaluating + self.reconciling + self.committed + self.error
    }

    pub fn finished(&self) -> usize {
        self.committed + self.error
    }
}

/// Concurrent map of table key to state.
#[derive(Debug, Default)]
pub struct TableRegistry {
    entries: RwLock<BTreeMap<String, TableSyncState>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, TableSyncState>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, TableSyncState>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace an entry.
    pub fn insert(&self, state: TableSyncState) {
        self.write().insert(state.key.clone(), state);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(&key.to_ascii_uppercase())
    }

    pub fn get(&self, key: &str) -> Option<TableSyncState> {
        self.read().get(&key.to_ascii_uppercase()).cloned()
    }

    /// Copy of every entry in key order.
    pub fn snapshot(&self) -> Vec<TableSyncState> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Mutate an entry in place. Returns false for an unknown key.
    pub fn update<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut TableSyncState),
    {
        let mut entries = self.write();
        match entries.get_mut(&key.to_ascii_uppercase()) {
            Some(state) => {
                f(state);
                state.updated_at = chrono::Utc::now();
                true
            }
            None => false,
        }
    }

    /// Move an entry to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&self, key: &str, next: TableStatus) -> Result<(), SyncError> {
        let mut entries = self.write();
        let state = entries
            .get_mut(&key.to_ascii_uppercase())
            .ok_or_else(|| SyncError::FatalConfiguration(format!("Unknown table {}", key)))?;

        if !state.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                table: state.key.clone(),
                from: state.status,
                to: next,
            });
        }

        tracing::debug!("{}: {} -> {}", state.key, state.status, next);
        state.status = next;
        state.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn set_phase(&self, key: &str, phase: ReconcilePhase) {
        self.update(key, |state| state.phase = phase);
    }

    /// Record a failure and move the entry to `Error`.
    pub fn fail(&self, key: &str, error: TableError) -> Result<(), SyncError> {
        self.transition(key, TableStatus::Error)?;
        self.update(key, |state| {
            state.phase = ReconcilePhase::Failed;
            state.error = Some(error);
        });
        Ok(())
    }

    /// Record a committed outcome and move the entry to `Committed`.
    pub fn complete(
        &self,
        key: &str,
        outcome: &ReconcileOutcome,
        elapsed_secs: f64,
    ) -> Result<(), SyncError> {
        self.transition(key, TableStatus::Committed)?;
        self.update(key, |state| {
            state.phase = ReconcilePhase::Committed;
            state.mode = Some(outcome.mode);
            state.rows_fetched = outcome.rows_fetched;
            state.rows_inserted = outcome.rows_inserted;
            state.rows_deleted = outcome.rows_deleted;
            state.elapsed_secs = elapsed_secs;
            state.error = None;
        });
        Ok(())
    }

    pub fn keys_with_status(&self, status: TableStatus) -> Vec<String> {
        self.read()
            .values()
            .filter(|state| state.status == status)
            .map(|state| state.key.clone())
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for state in self.read().values() {
            match state.status {
                TableStatus::Pending => counts.pending += 1,
                TableStatus::Evaluating => counts.evaluating += 1,
                TableStatus::Reconciling => counts.reconciling += 1,
                TableStatus::Committed => counts.committed += 1,
                TableStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}
