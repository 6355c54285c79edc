// ABOUTME: Database seams used by the engine - source reads and target writes
// ABOUTME: PostgreSQL implementations live in crate::postgres; tests use in-memory ones

#![allow(async_fn_in_trait)]

use anyhow::Result;
use std::collections::HashSet;

use crate::strategy::CopyStrategy;
use crate::token::VersionToken;
use crate::utils::quote_ident;

/// A table on one side of the sync, with the two columns the engine relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
    pub id_column: String,
    /// `None` when the table has no version-token column.
    pub version_column: Option<String>,
}

impl TableRef {
    /// `"schema"."name"`, quoted for SQL.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// The row population a strategy selects from one source table.
#[derive(Debug, Clone)]
pub struct TableQuery {
    pub table: TableRef,
    pub strategy: CopyStrategy,
    pub record_count: u64,
}

/// One `(row id, version token)` pair from a control scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRow {
    pub id: i64,
    pub token: Option<VersionToken>,
}

/// The narrow `(id, token)` projection of a strategy's row population,
/// ordered by descending row id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlScan {
    rows: Vec<ControlRow>,
}

impl ControlScan {
    pub fn new(rows: Vec<ControlRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ControlRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> HashSet<i64> {
        self.rows.iter().map(|row| row.id).collect()
    }

    pub fn min_id(&self) -> Option<i64> {
        self.rows.iter().map(|row| row.id).min()
    }

    pub fn max_token(&self) -> Option<VersionToken> {
        self.rows.iter().filter_map(|row| row.token).max()
    }
}

/// A full source row: id and token pulled out for the engine, the rest as a
/// JSON object keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub id: i64,
    pub token: Option<VersionToken>,
    pub data: serde_json::Value,
}

/// Narrowing applied to an incremental gap-fill fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchFilter {
    /// Rows with a token at or above this value.
    pub min_token: VersionToken,
    /// Rows with an id at or above this value.
    pub min_id: i64,
}

/// Read access to the source database.
pub trait SourceConnection {
    /// Row ids and tokens of the strategy's population, newest id first.
    async fn control_scan(&self, query: &TableQuery) -> Result<ControlScan>;

    /// Full rows (restricted to `fields`) of the strategy's population,
    /// optionally narrowed by `filter`, newest id first.
    async fn fetch_rows(
        &self,
        query: &TableQuery,
        fields: &[String],
        filter: Option<&FetchFilter>,
    ) -> Result<Vec<SourceRow>>;
}

/// Read and write access to the target database.
///
/// Write methods take `&mut self`: a target connection belongs to exactly one
/// table pipeline and carries that pipeline's open transaction.
pub trait TargetConnection {
    async fn count_rows(&self, table: &TableRef) -> Result<u64>;

    /// Rows whose own token is newer than `since` (all rows when `None`).
    async fn count_changed_since(
        &self,
        table: &TableRef,
        since: Option<VersionToken>,
    ) -> Result<u64>;

    async fn max_token(&self, table: &TableRef) -> Result<Option<VersionToken>>;

    async fn row_ids(&self, table: &TableRef) -> Result<HashSet<i64>>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn set_triggers_enabled(&mut self, table: &TableRef, enabled: bool) -> Result<()>;

    async fn truncate(&mut self, table: &TableRef) -> Result<()>;

    /// Insert `rows` restricted to `fields`, returning the inserted count.
    async fn bulk_load(
        &mut self,
        table: &TableRef,
        fields: &[String],
        rows: &[SourceRow],
    ) -> Result<u64>;

    /// Copy the control scan into a session-local working set.
    async fn stage_working_set(&mut self, scan: &ControlScan) -> Result<()>;

    /// Delete rows listed in the working set whose source token is newer
    /// than `since` (every listed row when `None`).
    async fn delete_modified_in_source(
        &mut self,
        table: &TableRef,
        since: Option<VersionToken>,
    ) -> Result<u64>;

    /// Delete rows whose own token is newer than `since`.
    async fn delete_modified_in_target(
        &mut self,
        table: &TableRef,
        since: VersionToken,
    ) -> Result<u64>;

    /// Delete rows whose id is absent from the working set.
    async fn delete_outside_working_set(&mut self, table: &TableRef) -> Result<u64>;

    async fn drop_working_set(&mut self) -> Result<()>;

    /// Raise the id sequence above the current maximum id, if it is behind.
    async fn reseed_identity(&mut self, table: &TableRef) -> Result<()>;
}

/// Opens fresh connections; every table pipeline gets its own pair.
pub trait ConnectionFactory {
    type Source: SourceConnection;
    type Target: TargetConnection;

    async fn connect_source(&self) -> Result<Self::Source>;

    async fn connect_target(&self) -> Result<Self::Target>;
}
