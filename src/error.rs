// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Classifies per-table failures so the orchestrator knows what to retry

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::registry::TableStatus;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed strategy directive or token text
    #[error("Parse error near '{token}': {message}")]
    Parse { token: String, message: String },

    /// Table lacks something its strategy requires
    #[error("Table {table} cannot be synced: {reason}")]
    CapabilityMismatch { table: String, reason: String },

    /// Connection loss, timeout, or any other failure reported by a database
    #[error("Database error: {0}")]
    TransientDatabase(String),

    /// Missing schema metadata or invalid configuration
    #[error("Configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Sync cancelled before commit")]
    Cancelled,

    #[error("Invalid status transition for {table}: {from} -> {to}")]
    InvalidTransition {
        table: String,
        from: TableStatus,
        to: TableStatus,
    },
}

impl SyncError {
    pub fn parse(token: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Parse {
            token: token.into(),
            message: message.into(),
        }
    }

    pub fn capability(table: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::CapabilityMismatch {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Parse { .. } => ErrorKind::Parse,
            SyncError::CapabilityMismatch { .. } => ErrorKind::CapabilityMismatch,
            SyncError::TransientDatabase(_) => ErrorKind::TransientDatabase,
            SyncError::FatalConfiguration(_) | SyncError::InvalidTransition { .. } => {
                ErrorKind::FatalConfiguration
            }
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Coarse classification recorded on a failed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Parse,
    CapabilityMismatch,
    TransientDatabase,
    FatalConfiguration,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::CapabilityMismatch => "capability",
            ErrorKind::TransientDatabase => "database",
            ErrorKind::FatalConfiguration => "configuration",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Failure recorded on a table's registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TableError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an error coming out of a table pipeline.
    ///
    /// A `SyncError` anywhere in the chain decides the kind; anything else
    /// (driver errors, I/O) is treated as a transient database failure.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<SyncError>())
            .map(SyncError::kind)
            .unwrap_or(ErrorKind::TransientDatabase);
        Self {
            kind,
            message: format!("{:#}", err),
        }
    }

    /// Only transient database failures are eligible for the retry stage.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::TransientDatabase
    }
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
