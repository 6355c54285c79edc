// ABOUTME: Schema discovery - table identifiers and column lists per database
// ABOUTME: Loaded once per run into a cache; copyable fields derive from both sides

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::Client;

/// Read-only view of one database's tables and columns.
pub trait SchemaCatalog {
    /// Case-insensitive table lookup.
    fn table_id(&self, name: &str) -> Option<u32>;

    /// Table name as the database spells it.
    fn table_name(&self, id: u32) -> Option<&str>;

    /// Columns in ordinal order.
    fn fields(&self, id: u32) -> Option<&[String]>;
}

#[derive(Debug, Clone)]
struct CachedTable {
    name: String,
    fields: Vec<String>,
}

/// In-memory catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    by_key: HashMap<String, u32>,
    tables: BTreeMap<u32, CachedTable>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. A later table with the same case-folded name replaces
    /// the earlier lookup entry.
    pub fn insert_table(&mut self, id: u32, name: &str, fields: Vec<String>) {
        self.by_key.insert(name.to_ascii_uppercase(), id);
        self.tables.insert(
            id,
            CachedTable {
                name: name.to_string(),
                fields,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Load every ordinary and partitioned table in `schema`.
    pub async fn load_postgres(client: &Client, schema: &str) -> Result<Self> {
        let table_rows = client
            .query(
                "SELECT c.oid, c.relname::text
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relkind IN ('r', 'p')
                 ORDER BY c.relname",
                &[&schema],
            )
            .await
            .with_context(|| format!("Failed to list tables in schema {}", schema))?;

        let column_rows = client
            .query(
                "SELECT table_name::text, column_name::text
                 FROM information_schema.columns
                 WHERE table_schema = $1
                 ORDER BY table_name, ordinal_position",
                &[&schema],
            )
            .await
            .with_context(|| format!("Failed to list columns in schema {}", schema))?;

        let mut columns: HashMap<String, Vec<String>> = HashMap::new();
        for row in &column_rows {
            let table: String = row.get(0);
            let column: String = row.get(1);
            columns.entry(table).or_default().push(column);
        }

        let mut cache = Self::new();
        for row in &table_rows {
            let oid: u32 = row.get(0);
            let name: String = row.get(1);
            let fields = columns.remove(&name).unwrap_or_default();
            cache.insert_table(oid, &name, fields);
        }

        tracing::debug!("Loaded {} tables from schema {}", cache.len(), schema);
        Ok(cache)
    }
}

impl SchemaCatalog for SchemaCache {
    fn table_id(&self, name: &str) -> Option<u32> {
        self.by_key.get(&name.trim().to_ascii_uppercase()).copied()
    }

    fn table_name(&self, id: u32) -> Option<&str> {
        self.tables.get(&id).map(|t| t.name.as_str())
    }

    fn fields(&self, id: u32) -> Option<&[String]> {
        self.tables.get(&id).map(|t| t.fields.as_slice())
    }
}

/// Find `column` among `fields`, ignoring case, returning the stored spelling.
pub fn find_field<'a>(fields: &'a [String], column: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.eq_ignore_ascii_case(column))
        .map(String::as_str)
}

/// Columns present on both sides, minus exclusions and the version column,
/// in source order.
///
/// The version column is never copied: each database maintains its own.
pub fn copyable_fields(
    source: &[String],
    target: &[String],
    excluded: &[String],
    version_column: Option<&str>,
) -> Vec<String> {
    source
        .iter()
        .filter(|field| find_field(target, field).is_some())
        .filter(|field| !excluded.iter().any(|e| e.eq_ignore_ascii_case(field)))
        .filter(|field| version_column.map_or(true, |v| !v.eq_ignore_ascii_case(field)))
        .cloned()
        .collect()
}
