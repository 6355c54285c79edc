// ABOUTME: Target-side writer - transactions, deletes, bulk loads and sequence fixes
// ABOUTME: Bulk loads go through jsonb_populate_recordset with one bound parameter per batch

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use tokio_postgres::Client;

use crate::db::{ControlScan, SourceRow, TableRef, TargetConnection};
use crate::error::SyncError;
use crate::token::VersionToken;
use crate::utils::quote_ident;

/// Session-local table holding the control scan during an incremental pass.
const WORKING_SET: &str = "delta_working_set";

/// Rows per working-set insert; arrays are bound, so this only bounds memory.
const WORKING_SET_CHUNK: usize = 50_000;

/// Applies reconciliation to the target database.
///
/// One `TargetWriter` owns one connection and at most one open transaction.
pub struct TargetWriter {
    client: Client,
    insert_batch_size: usize,
    in_transaction: bool,
}

impl TargetWriter {
    pub fn new(client: Client, insert_batch_size: usize) -> Self {
        Self {
            client,
            insert_batch_size: insert_batch_size.max(1),
            in_transaction: false,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn version_column<'t>(&self, table: &'t TableRef) -> Result<&'t str> {
        table.version_column.as_deref().ok_or_else(|| {
            SyncError::capability(table.display_name(), "table has no version-token column")
                .into()
        })
    }
}

/// Build the bulk insert for one batch.
///
/// ```sql
/// INSERT INTO "public"."t" ("a", "b")
/// SELECT "a", "b" FROM jsonb_populate_recordset(NULL::"public"."t", $1::jsonb)
/// ```
fn build_bulk_insert(table: &TableRef, fields: &[String]) -> String {
    let columns = fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb)",
        table = table.qualified(),
        columns = columns,
    )
}

impl TargetConnection for TargetWriter {
    async fn count_rows(&self, table: &TableRef) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", table.qualified());
        let row = self
            .client
            .query_one(&query, &[])
            .await
            .with_context(|| format!("Failed to count rows in {}", table.display_name()))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn count_changed_since(
        &self,
        table: &TableRef,
        since: Option<VersionToken>,
    ) -> Result<u64> {
        let Some(since) = since else {
            return self.count_rows(table).await;
        };
        let version = self.version_column(table)?;
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE {} > $1",
            table.qualified(),
            quote_ident(version)
        );
        let since = since.as_bytes().to_vec();
        let row = self
            .client
            .query_one(&query, &[&since])
            .await
            .with_context(|| format!("Failed to count changed rows in {}", table.display_name()))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn max_token(&self, table: &TableRef) -> Result<Option<VersionToken>> {
        let version = quote_ident(self.version_column(table)?);
        // bytea has no max() aggregate
        let query = format!(
            "SELECT {v} FROM {t} WHERE {v} IS NOT NULL ORDER BY {v} DESC LIMIT 1",
            v = version,
            t = table.qualified()
        );
        let row = self
            .client
            .query_opt(&query, &[])
            .await
            .with_context(|| format!("Failed to read max version of {}", table.display_name()))?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.try_get(0)?;
                Ok(Some(VersionToken::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn row_ids(&self, table: &TableRef) -> Result<HashSet<i64>> {
        let query = format!(
            "SELECT {}::bigint FROM {}",
            quote_ident(&table.id_column),
            table.qualified()
        );
        let rows = self
            .client
            .query(&query, &[])
            .await
            .with_context(|| format!("Failed to read row ids of {}", table.display_name()))?;
        rows.iter()
            .map(|row| row.try_get::<_, i64>(0).map_err(Into::into))
            .collect()
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            bail!("A transaction is already open on this connection");
        }
        self.client
            .batch_execute("BEGIN")
            .await
            .context("Failed to begin transaction")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .context("Failed to commit transaction")?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.client
            .batch_execute("ROLLBACK")
            .await
            .context("Failed to roll back transaction")
    }

    async fn set_triggers_enabled(&mut self, table: &TableRef, enabled: bool) -> Result<()> {
        let action = if enabled { "ENABLE" } else { "DISABLE" };
        // USER triggers only; internal constraint triggers need superuser
        let query = format!("ALTER TABLE {} {} TRIGGER USER", table.qualified(), action);
        self.client.batch_execute(&query).await.with_context(|| {
            format!(
                "Failed to {} triggers on {}",
                action.to_lowercase(),
                table.display_name()
            )
        })
    }

    async fn truncate(&mut self, table: &TableRef) -> Result<()> {
        let query = format!("TRUNCATE TABLE {}", table.qualified());
        self.client
            .batch_execute(&query)
            .await
            .with_context(|| format!("Failed to truncate {}", table.display_name()))
    }

    async fn bulk_load(
        &mut self,
        table: &TableRef,
        fields: &[String],
        rows: &[SourceRow],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let query = build_bulk_insert(table, fields);
        let statement = self
            .client
            .prepare(&query)
            .await
            .with_context(|| format!("Failed to prepare bulk insert into {}", table.display_name()))?;

        let mut inserted = 0u64;
        for chunk in rows.chunks(self.insert_batch_size) {
            let batch = serde_json::Value::Array(chunk.iter().map(|row| row.data.clone()).collect());
            inserted += self
                .client
                .execute(&statement, &[&batch])
                .await
                .with_context(|| format!("Failed to bulk insert into {}", table.display_name()))?;
        }

        Ok(inserted)
    }

    async fn stage_working_set(&mut self, scan: &ControlScan) -> Result<()> {
        if !self.in_transaction {
            bail!("The working set must be staged inside a transaction");
        }

        self.client
            .batch_execute(&format!(
                "CREATE TEMP TABLE {} (row_id bigint PRIMARY KEY, row_version bytea) ON COMMIT DROP",
                WORKING_SET
            ))
            .await
            .context("Failed to create working set")?;

        let insert = format!(
            "INSERT INTO {} (row_id, row_version) SELECT * FROM unnest($1::bigint[], $2::bytea[])",
            WORKING_SET
        );
        for chunk in scan.rows().chunks(WORKING_SET_CHUNK) {
            let ids: Vec<i64> = chunk.iter().map(|row| row.id).collect();
            let tokens: Vec<Option<Vec<u8>>> = chunk
                .iter()
                .map(|row| row.token.map(|t| t.as_bytes().to_vec()))
                .collect();
            self.client
                .execute(&insert, &[&ids, &tokens])
                .await
                .context("Failed to stage working set")?;
        }

        Ok(())
    }

    async fn delete_modified_in_source(
        &mut self,
        table: &TableRef,
        since: Option<VersionToken>,
    ) -> Result<u64> {
        let base = format!(
            "DELETE FROM {t} USING {ws} ws WHERE {t}.{id} = ws.row_id",
            t = table.qualified(),
            ws = WORKING_SET,
            id = quote_ident(&table.id_column)
        );
        let deleted = match since {
            Some(since) => {
                let since = since.as_bytes().to_vec();
                self.client
                    .execute(&format!("{} AND ws.row_version > $1", base), &[&since])
                    .await
            }
            None => self.client.execute(&base, &[]).await,
        }
        .with_context(|| format!("Failed to delete source-modified rows from {}", table.display_name()))?;
        Ok(deleted)
    }

    async fn delete_modified_in_target(
        &mut self,
        table: &TableRef,
        since: VersionToken,
    ) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE {} > $1",
            table.qualified(),
            quote_ident(self.version_column(table)?)
        );
        let since = since.as_bytes().to_vec();
        self.client
            .execute(&query, &[&since])
            .await
            .with_context(|| format!("Failed to delete target-modified rows from {}", table.display_name()))
    }

    async fn delete_outside_working_set(&mut self, table: &TableRef) -> Result<u64> {
        let query = format!(
            "DELETE FROM {t} WHERE NOT EXISTS (SELECT 1 FROM {ws} ws WHERE ws.row_id = {t}.{id})",
            t = table.qualified(),
            ws = WORKING_SET,
            id = quote_ident(&table.id_column)
        );
        self.client
            .execute(&query, &[])
            .await
            .with_context(|| format!("Failed to delete unselected rows from {}", table.display_name()))
    }

    async fn drop_working_set(&mut self) -> Result<()> {
        self.client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", WORKING_SET))
            .await
            .context("Failed to drop working set")
    }

    async fn reseed_identity(&mut self, table: &TableRef) -> Result<()> {
        let row = self
            .client
            .query_one(
                "SELECT pg_get_serial_sequence($1::text, $2::text)",
                &[&table.qualified(), &table.id_column],
            )
            .await
            .with_context(|| format!("Failed to look up id sequence of {}", table.display_name()))?;
        let Some(sequence): Option<String> = row.get(0) else {
            tracing::debug!("{} has no id sequence to adjust", table.display_name());
            return Ok(());
        };

        let max_id: i64 = self
            .client
            .query_one(
                &format!(
                    "SELECT COALESCE(MAX({}), 0)::bigint FROM {}",
                    quote_ident(&table.id_column),
                    table.qualified()
                ),
                &[],
            )
            .await
            .with_context(|| format!("Failed to read max id of {}", table.display_name()))?
            .get(0);

        // pg_get_serial_sequence returns an already-quoted name
        let current: i64 = self
            .client
            .query_one(&format!("SELECT last_value FROM {}", sequence), &[])
            .await
            .with_context(|| format!("Failed to read sequence {}", sequence))?
            .get(0);

        if current < max_id {
            self.client
                .execute("SELECT setval($1::text::regclass, $2)", &[&sequence, &max_id])
                .await
                .with_context(|| format!("Failed to advance sequence {}", sequence))?;
            tracing::info!(
                "Advanced sequence {} from {} to {} for {}",
                sequence,
                current,
                max_id,
                table.display_name()
            );
        }

        Ok(())
    }
}
