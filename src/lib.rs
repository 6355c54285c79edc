// ABOUTME: Library root for delta-replicator
// ABOUTME: Exposes the sync engine, its PostgreSQL driver and shared utilities

pub mod config;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod orchestrator;
pub mod postgres;
pub mod reconcile;
pub mod registry;
pub mod schema;
pub mod strategy;
pub mod timestamps;
pub mod token;
pub mod utils;

pub use config::SyncConfig;
pub use error::{ErrorKind, SyncError, TableError};
pub use orchestrator::{RunOptions, RunSummary, SyncOrchestrator};
pub use strategy::{CopyStrategy, StrategyResolver, TableDirective};
pub use timestamps::{TimestampStore, TokenSide};
pub use token::VersionToken;
