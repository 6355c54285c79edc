// ABOUTME: Sync configuration loaded from TOML, with defaults and validation
// ABOUTME: Directive lines are parsed here so bad input fails before any connection

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::evaluator::Thresholds;
use crate::strategy::{StrategyResolver, TableDirective};
use crate::utils::{
    validate_connection_string, validate_postgres_identifier, validate_source_target_different,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub source_url: String,
    pub target_url: String,
    pub schema: String,
    /// Row count for directives that do not name one.
    pub default_record_count: u64,
    /// Change percentage above which a table is fully reloaded.
    pub threshold_percent: f64,
    /// Excess target row percentage above which a table is fully reloaded.
    /// Falls back to `threshold_percent`.
    pub excess_threshold_percent: Option<f64>,
    pub max_parallel_tables: usize,
    pub max_parallel_fetch: usize,
    pub max_parallel_reconcile: usize,
    pub id_column: String,
    pub version_column: String,
    /// Columns never copied, matched case-insensitively.
    pub excluded_fields: Vec<String>,
    pub state_dir: PathBuf,
    /// Save stored tokens after every committed table instead of once at the end.
    pub persist_after_each_table: bool,
    pub insert_batch_size: usize,
    pub connect_retries: u32,
    /// Directive lines, see `StrategyResolver`.
    pub tables: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            target_url: String::new(),
            schema: "public".to_string(),
            default_record_count: 100_000,
            threshold_percent: 40.0,
            excess_threshold_percent: None,
            max_parallel_tables: 4,
            max_parallel_fetch: 4,
            max_parallel_reconcile: 2,
            id_column: "recid".to_string(),
            version_column: "recversion".to_string(),
            excluded_fields: Vec::new(),
            state_dir: PathBuf::from(".delta-replicator"),
            persist_after_each_table: false,
            insert_batch_size: 5000,
            connect_retries: 3,
            tables: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// `<config dir>/delta-replicator/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("Failed to determine config directory")?;
        Ok(base.join("delta-replicator").join("config.toml"))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            change_percent: self.threshold_percent,
            excess_percent: self.excess_threshold_percent.unwrap_or(self.threshold_percent),
        }
    }

    /// Check everything that can be checked without a database.
    pub fn validate(&self) -> Result<()> {
        validate_connection_string(&self.source_url).context("Invalid source_url")?;
        validate_connection_string(&self.target_url).context("Invalid target_url")?;
        validate_source_target_different(&self.source_url, &self.target_url)?;

        if !(self.threshold_percent > 0.0 && self.threshold_percent <= 100.0) {
            return Err(fatal(format!(
                "threshold_percent must be in (0, 100], got {}",
                self.threshold_percent
            )));
        }
        if let Some(excess) = self.excess_threshold_percent {
            if excess.is_nan() || excess <= 0.0 {
                return Err(fatal(format!(
                    "excess_threshold_percent must be positive, got {}",
                    excess
                )));
            }
        }

        for (name, value) in [
            ("max_parallel_tables", self.max_parallel_tables),
            ("max_parallel_fetch", self.max_parallel_fetch),
            ("max_parallel_reconcile", self.max_parallel_reconcile),
            ("insert_batch_size", self.insert_batch_size),
        ] {
            if value == 0 {
                return Err(fatal(format!("{} must be at least 1", name)));
            }
        }
        if self.default_record_count == 0 {
            return Err(fatal("default_record_count must be at least 1".to_string()));
        }

        validate_postgres_identifier(&self.schema).context("Invalid schema")?;
        validate_postgres_identifier(&self.id_column).context("Invalid id_column")?;
        validate_postgres_identifier(&self.version_column).context("Invalid version_column")?;
        for field in &self.excluded_fields {
            validate_postgres_identifier(field).context("Invalid excluded field")?;
        }

        self.directives()?;
        Ok(())
    }

    /// Parse every directive line. Blank lines and `#` comments are skipped;
    /// a table named twice is rejected.
    pub fn directives(&self) -> Result<Vec<TableDirective>, SyncError> {
        let resolver = StrategyResolver::new(&self.id_column);
        let mut seen = HashSet::new();
        let mut directives = Vec::new();

        for line in &self.tables {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let directive = resolver.resolve(line)?;
            if validate_postgres_identifier(&directive.table).is_err() {
                return Err(SyncError::parse(
                    directive.table,
                    "table name must be a plain identifier",
                ));
            }
            if !seen.insert(directive.key()) {
                return Err(SyncError::parse(
                    directive.table,
                    "table is listed more than once",
                ));
            }
            directives.push(directive);
        }

        Ok(directives)
    }
}

fn fatal(message: String) -> anyhow::Error {
    SyncError::FatalConfiguration(message).into()
}
