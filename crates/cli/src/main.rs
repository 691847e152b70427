use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli::{parse_query_type, render_outcome, render_search, render_status, StatusReport};
use notesync_core::config::{self, AppConfig};
use notesync_core::error::SyncError;
use notesync_core::lease::FileLease;
use notesync_core::pipeline::{self, CycleOutcome};
use notesync_core::search::SearchRequest;
use notesync_core::state::StateStore;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync { force, json } => run_sync(cfg, force, json).await,
        Commands::Daemon { interval_secs } => run_daemon(cfg, interval_secs).await,
        Commands::Status { json } => run_status(cfg, json).await,
        Commands::Search {
            query,
            limit,
            group,
            query_type,
            freshness_weight,
            keywords,
            full,
            json,
        } => {
            let kind = parse_query_type(&query_type).map_err(anyhow::Error::msg)?;
            let req = SearchRequest {
                query,
                limit,
                group,
                kind,
                freshness_weight,
                keywords,
                full,
            };
            run_search(cfg, req, json).await
        }
    }
}

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "Keep a vector index of your notes in sync and search it", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle
    Sync {
        /// Re-embed every note instead of syncing changes only
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Run sync cycles on an interval until interrupted
    Daemon {
        /// Seconds between cycles (defaults to sync.interval_secs)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Show what the last cycles did
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Semantic search with freshness-weighted ranking
    Search {
        /// Query text to embed and search
        query: String,
        /// Number of results
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only search this group (folder)
        #[arg(long)]
        group: Option<String>,
        /// auto|current|balanced|historical
        #[arg(long, default_value = "auto")]
        query_type: String,
        /// Override the freshness weight (0..1)
        #[arg(long)]
        freshness_weight: Option<f64>,
        /// Boost results mentioning these words (comma-separated)
        #[arg(long, value_delimiter = ',', num_args = 1.., default_values_t = Vec::<String>::new())]
        keywords: Vec<String>,
        /// Print whole note texts instead of previews
        #[arg(long, default_value_t = false)]
        full: bool,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
}

async fn run_sync(cfg: AppConfig, force: bool, json: bool) -> Result<()> {
    let orch = pipeline::build_orchestrator(&cfg).await?;
    let outcome = orch.run_cycle(force).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", render_outcome(&outcome));
    }
    match outcome {
        CycleOutcome::AlreadyRunning => Err(SyncError::LockContention.into()),
        CycleOutcome::Failed { error, .. } => anyhow::bail!("sync failed: {error}"),
        _ => Ok(()),
    }
}

async fn run_daemon(cfg: AppConfig, interval_secs: Option<u64>) -> Result<()> {
    let secs = interval_secs.unwrap_or(cfg.sync.interval_secs).max(1);
    let orch = pipeline::build_orchestrator(&cfg).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    orch.run_daemon(Duration::from_secs(secs), shutdown).await?;
    Ok(())
}

async fn run_status(cfg: AppConfig, json: bool) -> Result<()> {
    let store = pipeline::open_state_store(&cfg).await?;
    let holder = FileLease::new(&cfg.sync.lock_path).holder();
    let report = match StateStore::load(&store).await {
        Ok(state) => StatusReport::from_state(&state, holder),
        Err(SyncError::CorruptState(msg)) => StatusReport::unreadable(msg, holder),
        Err(e) => return Err(e).context("loading sync state"),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

async fn run_search(cfg: AppConfig, req: SearchRequest, json: bool) -> Result<()> {
    let service = pipeline::build_search_service(&cfg)?;
    let resp = service.search(req).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    } else {
        print!("{}", render_search(&resp));
    }
    Ok(())
}
