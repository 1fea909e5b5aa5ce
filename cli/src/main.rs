//! chainsync CLI — run the sync engine and inspect its state.
//!
//! Usage:
//! ```bash
//! chainsync run    --config chainsync.yaml
//! chainsync status --config chainsync.yaml --blocks 20
//! chainsync info   [--config chainsync.yaml]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainsync_core::checkpoint::CheckpointStore;
use chainsync_core::config::{ChainSyncConfig, LogConfig, StorageBackend, StorageConfig};
use chainsync_core::projection::{EnrichmentSource, ProjectionStore};
use chainsync_evm::{HealthReporter, SyncEngineBuilder};
use chainsync_rpc::ChainClientPool;
use chainsync_storage::InMemoryStorage;

#[derive(Parser)]
#[command(
    name = "chainsync",
    about = "Chain-to-database sync engine — ChainSync CLI",
    long_about = "
ChainSync: index pool, cycle and reputation contract events into SQL projections.

ENVIRONMENT VARIABLES:
  CHAINSYNC_DATABASE_URL   Overrides storage.url
  CHAINSYNC_START_BLOCK    Overrides indexer.start_block
  CHAINSYNC_RPC_URLS       Overrides rpc.endpoints (url[|weight],...)
  RUST_LOG                 Overrides the log section
",
    version
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync loop until Ctrl-C
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the persisted indexer state
    Status {
        #[arg(short, long)]
        config: PathBuf,
        /// How many recent checkpoint blocks to show
        #[arg(long, default_value_t = 10)]
        blocks: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration (defaults when no file is given)
    Info {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load_config(&config)?;
            init_tracing(&config.log, cli.verbose);
            cmd_run(config).await
        }
        Commands::Status { config, blocks, json } => {
            let config = load_config(&config)?;
            init_tracing(&config.log, cli.verbose);
            cmd_status(&config, blocks, json).await
        }
        Commands::Info { config } => cmd_info(config.as_deref()),
    }
}

fn load_config(path: &Path) -> Result<ChainSyncConfig> {
    let mut config = ChainSyncConfig::from_yaml_file(path)?;
    config.apply_env().context("applying environment overrides")?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` wins over the config file.
fn init_tracing(config: &LogConfig, verbose: bool) {
    let directives = if verbose {
        "debug".to_string()
    } else {
        config.directives()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

// ─── run ─────────────────────────────────────────────────────────────────────

async fn cmd_run(config: ChainSyncConfig) -> Result<()> {
    let client = Arc::new(
        ChainClientPool::from_config(&config.rpc).context("building the rpc client pool")?,
    );
    info!(
        indexer_id = %config.indexer.id,
        chain = %config.indexer.chain,
        endpoints = client.len(),
        backend = ?config.storage.backend,
        "starting chainsync"
    );

    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("memory backend: projections and progress are lost on exit");
            drive(&config, client, Arc::new(InMemoryStorage::new())).await
        }
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            let url = storage_url(&config.storage)?;
            let storage =
                chainsync_storage::sqlite::SqliteStorage::open_with(url, config.storage.max_connections)
                    .await
                    .with_context(|| format!("opening sqlite database {url}"))?;
            drive(&config, client, Arc::new(storage)).await
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => {
            let storage = connect_postgres(&config.storage).await?;
            drive(&config, client, Arc::new(storage)).await
        }
        #[allow(unreachable_patterns)]
        other => bail!("storage backend {other:?} is not compiled in; rebuild with the matching feature"),
    }
}

async fn drive<S>(config: &ChainSyncConfig, client: Arc<ChainClientPool>, storage: Arc<S>) -> Result<()>
where
    S: ProjectionStore + CheckpointStore + EnrichmentSource + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut engine = SyncEngineBuilder::from_config(config)
        .client(client)
        .storage(storage)
        .shutdown(shutdown_rx.clone())
        .build()
        .await
        .context("building the sync engine")?;

    let health = HealthReporter::new(
        engine.stats(),
        config.indexer.health_interval(),
        shutdown_rx,
    )
    .spawn();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing the current batch");
            request_shutdown(&shutdown_tx);
        }
    });

    let result = engine.run().await;
    health.abort();
    result.context("sync loop stopped with an error")?;

    let s = engine.stats().snapshot();
    info!(
        last_indexed = s.last_indexed_block,
        events = s.events_processed,
        batches = s.batches,
        "chainsync stopped"
    );
    Ok(())
}

/// Ask the sync loop to stop. `false` if it had already exited.
fn request_shutdown(tx: &watch::Sender<bool>) -> bool {
    if tx.send(true).is_err() {
        debug!("sync loop already stopped, shutdown signal dropped");
        return false;
    }
    true
}

// ─── status ──────────────────────────────────────────────────────────────────

async fn cmd_status(config: &ChainSyncConfig, blocks: usize, as_json: bool) -> Result<()> {
    let store = checkpoint_store(&config.storage).await?;
    let id = &config.indexer.id;

    let Some(state) = store.load_state(id).await? else {
        println!("indexer '{id}' has no saved state");
        return Ok(());
    };
    let marks = store.recent_checkpoint_blocks(id, blocks).await?;

    if as_json {
        let out = serde_json::json!({ "state": state, "checkpoint_blocks": marks });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Indexer {}", state.indexer_id);
    println!("  Last indexed block:  {}", state.last_indexed_block);
    println!("  Blocks processed:    {}", state.total_blocks_processed);
    println!("  Events processed:    {}", state.total_events_processed);
    println!("  Updated at:          {}", timestamp(state.updated_at));
    if let Some(at) = state.last_error_at {
        println!("  Last error at:       {}", timestamp(at));
    }

    if !state.recent_errors.is_empty() {
        println!("\nRecent errors ({}):", state.recent_errors.len());
        for e in state.recent_errors.iter().rev().take(5) {
            let range = e
                .range
                .map(|r| format!(" [{}..={}]", r.from, r.to))
                .unwrap_or_default();
            println!("  {} {}{}: {}", timestamp(e.at), e.kind, range, e.message);
        }
    }

    if !marks.is_empty() {
        println!("\nCheckpoint blocks:");
        for m in &marks {
            println!("  {:>12}  {:>5} events  {}", m.block_number, m.event_count, timestamp(m.recorded_at));
        }
    }
    Ok(())
}

async fn checkpoint_store(storage: &StorageConfig) -> Result<Arc<dyn CheckpointStore>> {
    match storage.backend {
        StorageBackend::Memory => bail!("the memory backend keeps no state between runs"),
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            let url = storage_url(storage)?;
            let s = chainsync_storage::sqlite::SqliteStorage::open_with(url, 1)
                .await
                .with_context(|| format!("opening sqlite database {url}"))?;
            Ok(Arc::new(s) as Arc<dyn CheckpointStore>)
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => {
            let s = connect_postgres(storage).await?;
            Ok(Arc::new(s) as Arc<dyn CheckpointStore>)
        }
        #[allow(unreachable_patterns)]
        other => bail!("storage backend {other:?} is not compiled in; rebuild with the matching feature"),
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn storage_url(storage: &StorageConfig) -> Result<&str> {
    storage
        .url
        .as_deref()
        .context("storage.url is required for SQL backends")
}

#[cfg(feature = "postgres")]
async fn connect_postgres(
    storage: &StorageConfig,
) -> Result<chainsync_storage::postgres::PostgresStorage> {
    use chainsync_storage::postgres::{PostgresOptions, PostgresStorage};

    let opts = PostgresOptions {
        max_connections: storage.max_connections,
        ..PostgresOptions::default()
    };
    PostgresStorage::connect_with_options(storage_url(storage)?, opts)
        .await
        .context("connecting to postgres")
}

fn timestamp(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| unix.to_string())
}

// ─── info ────────────────────────────────────────────────────────────────────

fn cmd_info(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            let mut c = ChainSyncConfig::from_yaml_file(p)?;
            c.apply_env()?;
            c
        }
        None => ChainSyncConfig::default(),
    };

    println!("ChainSync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Start position: {:?}", config.indexer.start_position());
    let mut backends = vec!["memory"];
    if cfg!(feature = "sqlite") {
        backends.push("sqlite");
    }
    if cfg!(feature = "postgres") {
        backends.push("postgres");
    }
    println!("  Storage backends: {}", backends.join(", "));
    println!();
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
