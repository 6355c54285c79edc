// ABOUTME: In-memory source and target databases for engine and orchestrator tests
// ABOUTME: Each side keeps its own token clock; target writes roll back per table

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use delta_replicator::db::{
    ConnectionFactory, ControlRow, ControlScan, FetchFilter, SourceConnection, SourceRow,
    TableQuery, TableRef, TargetConnection,
};
use delta_replicator::reconcile::ReconcileJob;
use delta_replicator::schema::SchemaCache;
use delta_replicator::strategy::CopyStrategy;
use delta_replicator::token::VersionToken;

pub const SCHEMA: &str = "public";
pub const ID_COLUMN: &str = "recid";
pub const VERSION_COLUMN: &str = "recversion";

#[derive(Debug, Clone, PartialEq)]
pub struct MemRow {
    pub token: Option<VersionToken>,
    pub data: Value,
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    has_version: bool,
    source: BTreeMap<i64, MemRow>,
    target: BTreeMap<i64, MemRow>,
    triggers_enabled: bool,
    reseeds: u32,
}

/// Operations that can be told to fail for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ControlScan,
    FetchRows,
    BulkLoad,
    Truncate,
}

#[derive(Debug, Default)]
struct WorldState {
    tables: BTreeMap<String, MemTable>,
    source_clock: u64,
    target_clock: u64,
    failures: HashMap<(String, FailPoint), Option<u32>>,
    fetch_calls: u32,
}

impl WorldState {
    fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", name))
    }

    fn next_source_token(&mut self) -> VersionToken {
        self.source_clock += 1;
        VersionToken::from_u64(self.source_clock)
    }

    fn next_target_token(&mut self) -> VersionToken {
        self.target_clock += 1;
        VersionToken::from_u64(self.target_clock)
    }

    /// Consume one injected failure, if any is armed.
    fn trip(&mut self, table: &str, point: FailPoint) -> Result<()> {
        let key = (table.to_ascii_lowercase(), point);
        match self.failures.get_mut(&key) {
            None => Ok(()),
            Some(None) => bail!("injected {:?} failure on {}", point, table),
            Some(Some(remaining)) => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.failures.remove(&key);
                }
                bail!("injected {:?} failure on {}", point, table)
            }
        }
    }
}

/// Shared state behind every fake connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorld {
    state: Arc<Mutex<WorldState>>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        let world = Self::default();
        {
            let mut state = world.lock();
            state.source_clock = 1_000;
            state.target_clock = 0;
        }
        world
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap()
    }

    pub fn create_table(&self, name: &str, has_version: bool) {
        self.lock().tables.insert(
            name.to_ascii_lowercase(),
            MemTable {
                has_version,
                triggers_enabled: true,
                ..MemTable::default()
            },
        );
    }

    /// Create a table with source rows `1..=rows`.
    pub fn seed(&self, name: &str, rows: i64) {
        self.create_table(name, true);
        for id in 1..=rows {
            self.source_insert(name, id, &format!("row {}", id));
        }
    }

    pub fn source_insert(&self, name: &str, id: i64, label: &str) {
        let mut state = self.lock();
        let has_version = state.table(name).unwrap().has_version;
        let token = has_version.then(|| state.next_source_token());
        state.table_mut(name).unwrap().source.insert(
            id,
            MemRow {
                token,
                data: json!({ "recid": id, "name": label }),
            },
        );
    }

    pub fn source_update(&self, name: &str, id: i64, label: &str) {
        self.source_insert(name, id, label);
    }

    pub fn source_delete(&self, name: &str, id: i64) {
        self.lock().table_mut(name).unwrap().source.remove(&id);
    }

    /// A local edit on the target, which gets a fresh target token.
    pub fn target_update(&self, name: &str, id: i64, label: &str) {
        let mut state = self.lock();
        let token = state.next_target_token();
        let table = state.table_mut(name).unwrap();
        let has_version = table.has_version;
        table.target.insert(
            id,
            MemRow {
                token: has_version.then_some(token),
                data: json!({ "recid": id, "name": label }),
            },
        );
    }

    pub fn target_ids(&self, name: &str) -> BTreeSet<i64> {
        self.lock().table(name).unwrap().target.keys().copied().collect()
    }

    pub fn target_label(&self, name: &str, id: i64) -> Option<String> {
        self.lock()
            .table(name)
            .unwrap()
            .target
            .get(&id)
            .and_then(|row| row.data.get("name").and_then(Value::as_str).map(str::to_string))
    }

    /// Ids of the newest `count` source rows.
    pub fn top_source_ids(&self, name: &str, count: usize) -> BTreeSet<i64> {
        self.lock()
            .table(name)
            .unwrap()
            .source
            .keys()
            .rev()
            .take(count)
            .copied()
            .collect()
    }

    pub fn triggers_enabled(&self, name: &str) -> bool {
        self.lock().table(name).unwrap().triggers_enabled
    }

    pub fn reseeds(&self, name: &str) -> u32 {
        self.lock().table(name).unwrap().reseeds
    }

    pub fn fetch_calls(&self) -> u32 {
        self.lock().fetch_calls
    }

    /// Fail `point` on `table` every time.
    pub fn fail_always(&self, table: &str, point: FailPoint) {
        self.lock()
            .failures
            .insert((table.to_ascii_lowercase(), point), None);
    }

    /// Fail `point` on `table` the next `times` times.
    pub fn fail_times(&self, table: &str, point: FailPoint, times: u32) {
        self.lock()
            .failures
            .insert((table.to_ascii_lowercase(), point), Some(times));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn fields(has_version: bool) -> Vec<String> {
        let mut fields = vec![ID_COLUMN.to_string(), "name".to_string()];
        if has_version {
            fields.push(VERSION_COLUMN.to_string());
        }
        fields
    }

    /// Catalog with every table, identical on both sides.
    pub fn catalog(&self) -> SchemaCache {
        let state = self.lock();
        let mut cache = SchemaCache::new();
        for (oid, (name, table)) in state.tables.iter().enumerate() {
            cache.insert_table(16_384 + oid as u32, name, Self::fields(table.has_version));
        }
        cache
    }

    pub fn table_ref(&self, name: &str) -> TableRef {
        let has_version = self.lock().table(name).unwrap().has_version;
        TableRef {
            schema: SCHEMA.to_string(),
            name: name.to_ascii_lowercase(),
            id_column: ID_COLUMN.to_string(),
            version_column: has_version.then(|| VERSION_COLUMN.to_string()),
        }
    }

    /// Reconcile job for a row-count strategy over `name`.
    pub fn job(
        &self,
        name: &str,
        record_count: u64,
        stored: Option<(VersionToken, VersionToken)>,
    ) -> ReconcileJob {
        let table = self.table_ref(name);
        let optimized = table.version_column.is_some() && stored.is_some();
        ReconcileJob {
            query: TableQuery {
                table: table.clone(),
                strategy: CopyStrategy::RowCount {
                    record_count: None,
                    force_full_reload: false,
                },
                record_count,
            },
            target_table: table,
            fields: vec![ID_COLUMN.to_string(), "name".to_string()],
            stored_source: stored.map(|(source, _)| source),
            stored_target: stored.map(|(_, target)| target),
            optimized,
        }
    }

    pub fn source(&self) -> MemorySource {
        MemorySource {
            world: self.clone(),
        }
    }

    pub fn target(&self) -> MemoryTarget {
        MemoryTarget {
            world: self.clone(),
            in_transaction: false,
            snapshots: HashMap::new(),
            working_set: None,
        }
    }

    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory {
            world: self.clone(),
        }
    }
}

fn project(data: &Value, fields: &[String], id: i64, token: Option<VersionToken>) -> Value {
    let mut out = Map::new();
    if let Value::Object(map) = data {
        for field in fields {
            if let Some(value) = map.get(field) {
                out.insert(field.clone(), value.clone());
            }
        }
    }
    out.insert(ID_COLUMN.to_string(), json!(id));
    if let Some(token) = token {
        out.insert(VERSION_COLUMN.to_string(), json!(token.to_hex()));
    }
    Value::Object(out)
}

pub struct MemorySource {
    world: MemoryWorld,
}

impl SourceConnection for MemorySource {
    async fn control_scan(&self, query: &TableQuery) -> Result<ControlScan> {
        let mut state = self.world.lock();
        state.trip(&query.table.name, FailPoint::ControlScan)?;
        let table = state.table(&query.table.name)?;
        let rows = table
            .source
            .iter()
            .rev()
            .take(query.record_count as usize)
            .map(|(&id, row)| ControlRow {
                id,
                token: row.token,
            })
            .collect();
        Ok(ControlScan::new(rows))
    }

    async fn fetch_rows(
        &self,
        query: &TableQuery,
        fields: &[String],
        filter: Option<&FetchFilter>,
    ) -> Result<Vec<SourceRow>> {
        let mut state = self.world.lock();
        state.fetch_calls += 1;
        state.trip(&query.table.name, FailPoint::FetchRows)?;
        let table = state.table(&query.table.name)?;
        if filter.is_some() && !table.has_version {
            bail!("column \"recversion\" does not exist");
        }
        Ok(table
            .source
            .iter()
            .rev()
            .filter(|&(&id, row)| match filter {
                Some(filter) => {
                    id >= filter.min_id && row.token.is_some_and(|t| t >= filter.min_token)
                }
                None => true,
            })
            .take(query.record_count as usize)
            .map(|(&id, row)| SourceRow {
                id,
                token: row.token,
                data: project(&row.data, fields, id, row.token),
            })
            .collect())
    }
}

pub struct MemoryTarget {
    world: MemoryWorld,
    in_transaction: bool,
    snapshots: HashMap<String, BTreeMap<i64, MemRow>>,
    working_set: Option<Vec<ControlRow>>,
}

impl MemoryTarget {
    /// Remember a table's rows before its first write in a transaction.
    fn touch(&mut self, state: &WorldState, name: &str) -> Result<()> {
        if self.in_transaction {
            let key = name.to_ascii_lowercase();
            if !self.snapshots.contains_key(&key) {
                let rows = state.table(name)?.target.clone();
                self.snapshots.insert(key, rows);
            }
        }
        Ok(())
    }

    fn working_set(&self) -> Result<&[ControlRow]> {
        self.working_set
            .as_deref()
            .ok_or_else(|| anyhow!("relation \"delta_working_set\" does not exist"))
    }
}

impl TargetConnection for MemoryTarget {
    async fn count_rows(&self, table: &TableRef) -> Result<u64> {
        Ok(self.world.lock().table(&table.name)?.target.len() as u64)
    }

    async fn count_changed_since(
        &self,
        table: &TableRef,
        since: Option<VersionToken>,
    ) -> Result<u64> {
        let state = self.world.lock();
        let mem = state.table(&table.name)?;
        if since.is_some() && !mem.has_version {
            bail!("column \"recversion\" does not exist");
        }
        Ok(mem
            .target
            .values()
            .filter(|row| match since {
                Some(since) => row.token.is_some_and(|t| t > since),
                None => true,
            })
            .count() as u64)
    }

    async fn max_token(&self, table: &TableRef) -> Result<Option<VersionToken>> {
        let state = self.world.lock();
        Ok(state
            .table(&table.name)?
            .target
            .values()
            .filter_map(|row| row.token)
            .max())
    }

    async fn row_ids(&self, table: &TableRef) -> Result<HashSet<i64>> {
        Ok(self
            .world
            .lock()
            .table(&table.name)?
            .target
            .keys()
            .copied()
            .collect())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            bail!("transaction already open");
        }
        self.in_transaction = true;
        self.snapshots.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.snapshots.clear();
        self.working_set = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let world = self.world.clone();
        let mut state = world.lock();
        for (name, rows) in self.snapshots.drain() {
            state.table_mut(&name)?.target = rows;
        }
        self.in_transaction = false;
        self.working_set = None;
        Ok(())
    }

    async fn set_triggers_enabled(&mut self, table: &TableRef, enabled: bool) -> Result<()> {
        self.world.lock().table_mut(&table.name)?.triggers_enabled = enabled;
        Ok(())
    }

    async fn truncate(&mut self, table: &TableRef) -> Result<()> {
        let world = self.world.clone();
        let mut state = world.lock();
        state.trip(&table.name, FailPoint::Truncate)?;
        self.touch(&state, &table.name)?;
        state.table_mut(&table.name)?.target.clear();
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        table: &TableRef,
        fields: &[String],
        rows: &[SourceRow],
    ) -> Result<u64> {
        let world = self.world.clone();
        let mut state = world.lock();
        state.trip(&table.name, FailPoint::BulkLoad)?;
        self.touch(&state, &table.name)?;

        let has_version = state.table(&table.name)?.has_version;
        let mut inserted = 0;
        for row in rows {
            let token = has_version.then(|| state.next_target_token());
            let mem = state.table_mut(&table.name)?;
            if mem.target.contains_key(&row.id) {
                bail!("duplicate key value violates unique constraint on {}", row.id);
            }
            mem.target.insert(
                row.id,
                MemRow {
                    token,
                    data: project(&row.data, fields, row.id, None),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn stage_working_set(&mut self, scan: &ControlScan) -> Result<()> {
        if !self.in_transaction {
            bail!("The working set must be staged inside a transaction");
        }
        self.working_set = Some(scan.rows().to_vec());
        Ok(())
    }

    async fn delete_modified_in_source(
        &mut self,
        table: &TableRef,
        since: Option<VersionToken>,
    ) -> Result<u64> {
        let doomed: HashSet<i64> = self
            .working_set()?
            .iter()
            .filter(|row| match since {
                Some(since) => row.token.is_some_and(|t| t > since),
                None => true,
            })
            .map(|row| row.id)
            .collect();

        let world = self.world.clone();
        let mut state = world.lock();
        self.touch(&state, &table.name)?;
        let target = &mut state.table_mut(&table.name)?.target;
        let before = target.len();
        target.retain(|id, _| !doomed.contains(id));
        Ok((before - target.len()) as u64)
    }

    async fn delete_modified_in_target(
        &mut self,
        table: &TableRef,
        since: VersionToken,
    ) -> Result<u64> {
        let world = self.world.clone();
        let mut state = world.lock();
        self.touch(&state, &table.name)?;
        let target = &mut state.table_mut(&table.name)?.target;
        let before = target.len();
        target.retain(|_, row| !row.token.is_some_and(|t| t > since));
        Ok((before - target.len()) as u64)
    }

    async fn delete_outside_working_set(&mut self, table: &TableRef) -> Result<u64> {
        let keep: HashSet<i64> = self.working_set()?.iter().map(|row| row.id).collect();

        let world = self.world.clone();
        let mut state = world.lock();
        self.touch(&state, &table.name)?;
        let target = &mut state.table_mut(&table.name)?.target;
        let before = target.len();
        target.retain(|id, _| keep.contains(id));
        Ok((before - target.len()) as u64)
    }

    async fn drop_working_set(&mut self) -> Result<()> {
        self.working_set = None;
        Ok(())
    }

    async fn reseed_identity(&mut self, table: &TableRef) -> Result<()> {
        self.world.lock().table_mut(&table.name)?.reseeds += 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryFactory {
    world: MemoryWorld,
}

impl ConnectionFactory for MemoryFactory {
    type Source = MemorySource;
    type Target = MemoryTarget;

    async fn connect_source(&self) -> Result<MemorySource> {
        Ok(self.world.source())
    }

    async fn connect_target(&self) -> Result<MemoryTarget> {
        Ok(self.world.target())
    }
}
