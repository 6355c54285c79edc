// ABOUTME: PostgreSQL driver layer for source reads and target writes
// ABOUTME: PostgresConnector opens one fresh connection pair per table pipeline

pub mod connection;
pub mod reader;
pub mod sql;
pub mod writer;

pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use reader::SourceReader;
pub use sql::{control_query, data_query, BoundSql, SqlParam};
pub use writer::TargetWriter;

use anyhow::{Context, Result};

use crate::db::ConnectionFactory;

/// Opens PostgreSQL connections for the orchestrator.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    source_url: String,
    target_url: String,
    connect_retries: u32,
    insert_batch_size: usize,
}

impl PostgresConnector {
    pub fn new(
        source_url: impl Into<String>,
        target_url: impl Into<String>,
        connect_retries: u32,
        insert_batch_size: usize,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            target_url: target_url.into(),
            connect_retries,
            insert_batch_size,
        }
    }
}

impl ConnectionFactory for PostgresConnector {
    type Source = SourceReader;
    type Target = TargetWriter;

    async fn connect_source(&self) -> Result<SourceReader> {
        let client = connect_with_retry(&self.source_url, self.connect_retries)
            .await
            .context("Failed to connect to source database")?;
        Ok(SourceReader::new(client))
    }

    async fn connect_target(&self) -> Result<TargetWriter> {
        let client = connect_with_retry(&self.target_url, self.connect_retries)
            .await
            .context("Failed to connect to target database")?;
        Ok(TargetWriter::new(client, self.insert_batch_size))
    }
}
