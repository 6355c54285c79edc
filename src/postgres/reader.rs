// ABOUTME: Source-side reader - control scans and row fetches over tokio-postgres
// ABOUTME: Rows come back as jsonb so any column types survive the trip to the target

use anyhow::{Context, Result};
use tokio_postgres::{Client, Row};

use super::sql::{control_query, data_query};
use crate::db::{ControlRow, ControlScan, FetchFilter, SourceConnection, SourceRow, TableQuery};
use crate::token::VersionToken;

/// Reads a strategy's row population from the source database.
///
/// The control scan only ships `(id, version)` pairs, so sizing a table's
/// change volume costs a fraction of reading the full rows.
pub struct SourceReader {
    client: Client,
}

impl SourceReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn decode_token(bytes: Option<Vec<u8>>) -> Result<Option<VersionToken>> {
    bytes
        .map(|bytes| VersionToken::from_slice(&bytes))
        .transpose()
        .map_err(Into::into)
}

fn decode_control_row(row: &Row) -> Result<ControlRow> {
    Ok(ControlRow {
        id: row.try_get("row_id")?,
        token: decode_token(row.try_get("row_version")?)?,
    })
}

fn decode_source_row(row: &Row) -> Result<SourceRow> {
    Ok(SourceRow {
        id: row.try_get("row_id")?,
        token: decode_token(row.try_get("row_version")?)?,
        data: row.try_get("row_data")?,
    })
}

impl SourceConnection for SourceReader {
    async fn control_scan(&self, query: &TableQuery) -> Result<ControlScan> {
        let bound = control_query(query);
        tracing::debug!("Control scan for {}: {}", query.table.display_name(), bound.sql);

        let rows = self
            .client
            .query(&bound.sql, &bound.param_refs())
            .await
            .with_context(|| format!("Failed to run control scan on {}", query.table.display_name()))?;

        let rows = rows
            .iter()
            .map(decode_control_row)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid control scan row in {}", query.table.display_name()))?;

        Ok(ControlScan::new(rows))
    }

    async fn fetch_rows(
        &self,
        query: &TableQuery,
        fields: &[String],
        filter: Option<&FetchFilter>,
    ) -> Result<Vec<SourceRow>> {
        let bound = data_query(query, fields, filter)?;
        tracing::debug!("Data fetch for {}: {}", query.table.display_name(), bound.sql);

        let rows = self
            .client
            .query(&bound.sql, &bound.param_refs())
            .await
            .with_context(|| format!("Failed to fetch rows from {}", query.table.display_name()))?;

        rows.iter()
            .map(decode_source_row)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid data row in {}", query.table.display_name()))
    }
}
