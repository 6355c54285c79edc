// ABOUTME: CLI entry point for delta-replicator
// ABOUTME: Parses commands and routes to sync, token maintenance and config checks

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use delta_replicator::orchestrator::{RunOptions, RunSummary, SyncOrchestrator};
use delta_replicator::postgres::{self, PostgresConnector};
use delta_replicator::registry::TableRegistry;
use delta_replicator::schema::SchemaCache;
use delta_replicator::{SyncConfig, TimestampStore, TokenSide};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "delta-replicator")]
#[command(about = "Incremental table-subset sync from a remote PostgreSQL source", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// Path to the TOML config (defaults to <config dir>/delta-replicator/config.toml)
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
    /// Source database URL, overrides source_url from the config
    #[arg(long = "source", env = "DELTA_SOURCE_URL")]
    source_url: Option<String>,
    /// Target database URL, overrides target_url from the config
    #[arg(long = "target", env = "DELTA_TARGET_URL")]
    target_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync over every configured table
    Sync {
        #[command(flatten)]
        config: ConfigArgs,
        /// Only sync this table (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,
        /// Reload every table in full, ignoring stored tokens
        #[arg(long)]
        full_reload: bool,
        /// Write the run summary as JSON to this path
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Parse and validate the config and its table directives
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Inspect or reset stored version tokens
    Tokens {
        /// Directory holding the token files
        #[arg(long = "state-dir", default_value = ".delta-replicator")]
        state_dir: PathBuf,
        #[command(subcommand)]
        action: TokensAction,
    },
}

#[derive(Subcommand)]
enum TokensAction {
    /// List stored tokens per table
    Show,
    /// Forget the tokens of one table so its next sync is a full reload
    Clear { table: String },
    /// Forget every stored token
    ClearAll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    postgres::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Sync {
            config,
            tables,
            full_reload,
            summary,
        } => {
            let config = load_config(&config)?;
            let options = RunOptions {
                only_tables: tables,
                force_full_reload: full_reload,
            };
            run_sync(config, options, summary.as_deref()).await
        }
        Commands::Check { config } => {
            let config = load_config(&config)?;
            let directives = config.directives()?;
            for directive in &directives {
                println!("  {:<30} {}", directive.table, directive.strategy);
                for warning in &directive.warnings {
                    println!("    warning: {}", warning);
                }
            }
            println!("Config OK: {} tables", directives.len());
            Ok(())
        }
        Commands::Tokens { state_dir, action } => run_tokens(&state_dir, action).await,
    }
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<SyncConfig> {
    let path = match &args.config_path {
        Some(path) => path.clone(),
        None => SyncConfig::default_path()?,
    };
    let mut config = SyncConfig::load(&path)?;
    if let Some(url) = &args.source_url {
        config.source_url = url.clone();
    }
    if let Some(url) = &args.target_url {
        config.target_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_sync(
    config: SyncConfig,
    options: RunOptions,
    summary_path: Option<&Path>,
) -> anyhow::Result<()> {
    let directives = config.directives()?;
    let store = Arc::new(TimestampStore::load(&config.state_dir).await?);

    tracing::info!("Loading schema catalogs...");
    let source_client = postgres::connect_with_retry(&config.source_url, config.connect_retries)
        .await
        .context("Failed to connect to source database")?;
    let target_client = postgres::connect_with_retry(&config.target_url, config.connect_retries)
        .await
        .context("Failed to connect to target database")?;
    let source_catalog = SchemaCache::load_postgres(&source_client, &config.schema).await?;
    let target_catalog = SchemaCache::load_postgres(&target_client, &config.schema).await?;
    drop(source_client);
    drop(target_client);

    let connector = PostgresConnector::new(
        config.source_url.clone(),
        config.target_url.clone(),
        config.connect_retries,
        config.insert_batch_size,
    );
    let orchestrator = SyncOrchestrator::new(config, connector, store);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, cancelling after in-flight steps");
            cancel.cancel();
        }
    });

    let bar = ProgressBar::new(directives.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}")
            .context("Invalid progress template")?
            .progress_chars("##-"),
    );
    let ticker = tokio::spawn(track_progress(orchestrator.registry(), bar.clone()));

    let result = orchestrator
        .run(&directives, &source_catalog, &target_catalog, &options)
        .await;

    ticker.abort();
    bar.finish_and_clear();

    let summary = result?;
    print_summary(&summary);

    if let Some(path) = summary_path {
        let json = serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    }

    if summary.has_failures() {
        bail!("{} of {} tables failed", summary.failed(), summary.tables.len());
    }
    if summary.cancelled {
        bail!("Sync cancelled");
    }
    Ok(())
}

async fn track_progress(registry: Arc<TableRegistry>, bar: ProgressBar) {
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    loop {
        interval.tick().await;
        let counts = registry.counts();
        bar.set_length(counts.total() as u64);
        bar.set_position(counts.finished() as u64);

        let active: Vec<String> = registry
            .snapshot()
            .into_iter()
            .filter(|state| !state.status.is_terminal() && state.attempts > 0)
            .map(|state| format!("{} ({})", state.key, state.phase))
            .collect();
        bar.set_message(active.join(", "));
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("========================================");
    println!("Sync summary");
    println!("========================================");
    for table in &summary.tables {
        match &table.error {
            Some(error) => println!("  {:<30} {:<10} {}", table.table, table.status, error),
            None => println!(
                "  {:<30} {:<10} {:<12} +{} -{} ({:.1}s)",
                table.table,
                table.status,
                table
                    .mode
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                table.rows_inserted,
                table.rows_deleted,
                table.elapsed_secs
            ),
        }
    }
    println!();
    println!(
        "  Tables committed: {}, failed: {}",
        summary.committed(),
        summary.failed()
    );
    println!(
        "  Rows inserted: {}, deleted: {}",
        summary.rows_inserted, summary.rows_deleted
    );
    println!(
        "  Duration: {:.1}s",
        (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0
    );
}

async fn run_tokens(state_dir: &Path, action: TokensAction) -> anyhow::Result<()> {
    let store = TimestampStore::load(state_dir).await?;

    match action {
        TokensAction::Show => {
            let tables = store.tables();
            if tables.is_empty() {
                println!("No stored tokens.");
                return Ok(());
            }
            println!("  {:<30} {:<20} {:<20}", "TABLE", "SOURCE", "TARGET");
            for table in tables {
                let show = |side| {
                    store
                        .get(&table, side)
                        .map(|t| t.to_hex())
                        .unwrap_or_else(|| "-".to_string())
                };
                println!(
                    "  {:<30} {:<20} {:<20}",
                    table,
                    show(TokenSide::Source),
                    show(TokenSide::Target)
                );
            }
        }
        TokensAction::Clear { table } => {
            if store.clear(&table) {
                store.save(state_dir).await?;
                println!("Cleared stored tokens for {}", table.to_ascii_uppercase());
            } else {
                println!("No stored tokens for {}", table.to_ascii_uppercase());
            }
        }
        TokensAction::ClearAll => {
            store.clear_all();
            store.save(state_dir).await?;
            println!("Cleared all stored tokens.");
        }
    }

    Ok(())
}
