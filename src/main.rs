//! Process entry points
//!
//! `lotcrawl scheduler <schedulerId>` runs the long-lived daemon;
//! `lotcrawl debug-run …` does a single pass over one URL with tree dumps
//! enabled. `ENVIRONMENT` selects log verbosity and gates uploads and
//! destructive cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use lotcrawl::images::BlobStore;
use lotcrawl::scheduler::{self, SchedulerState};
use lotcrawl::settings::{Env, ScraperKind, SettingsStore, TableCache, TaskConfig};
use lotcrawl::store::Store;

#[derive(Parser)]
#[command(name = "lotcrawl", about = "Adaptive listing scraper and scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon for a scheduler id.
    Scheduler { scheduler_id: String },
    /// One-shot scrape of a single URL.
    DebugRun {
        scheduler_id: String,
        /// One of: catalog, vdp, catalog_static.
        scraper_type: String,
        domain: String,
        locale: String,
        url: String,
        /// Task configuration as JSON.
        config_json: String,
        run_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = Env::from_process_env();

    match cli.command {
        Command::Scheduler { scheduler_id } => {
            let _log_guard = init_logging(&scheduler_id, env)?;
            let state = build_state(&scheduler_id, env, None).await?;
            scheduler::run_scheduler(state).await
        }
        Command::DebugRun {
            scheduler_id,
            scraper_type,
            domain,
            locale,
            url,
            config_json,
            run_id,
        } => {
            let _log_guard = init_logging(&scheduler_id, env)?;
            let Some(kind) = ScraperKind::parse(&scraper_type) else {
                bail!("unknown scraper type: {scraper_type}");
            };
            let config: TaskConfig =
                serde_json::from_str(&config_json).context("parsing task configuration")?;

            let state = build_state(&scheduler_id, env, Some(PathBuf::from("debug"))).await?;
            scheduler::debug_run(state, kind, &domain, &locale, &url, config, run_id).await
        }
    }
}

async fn build_state(
    scheduler_id: &str,
    env: Env,
    tree_dump_dir: Option<PathBuf>,
) -> Result<Arc<SchedulerState>> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let store = Arc::new(Store::connect(&database_url).await.context("connecting to database")?);

    let settings = Arc::new(SettingsStore::load(&store, scheduler_id, env).await?);
    settings.spawn_refresh(Arc::clone(&store), Duration::from_secs(10 * 60));

    let tables = Arc::new(TableCache::new(Arc::clone(&store)));
    tables.warm(settings.referenced_tables()).await;
    tables.spawn_refresh(Duration::from_secs(15 * 60));

    let blob_root = std::env::var("BLOB_STORE_ROOT").unwrap_or_else(|_| "blob_store".into());
    let blob = BlobStore::new(PathBuf::from(blob_root), env);

    let mut state = SchedulerState::new(settings, store, tables, blob, env);
    state.tree_dump_dir = tree_dump_dir;
    Ok(Arc::new(state))
}

/// Console plus per-run log file `<schedulerId>_<YYYY-MM-DD_HH-MM>.log`.
/// PROD logs warnings, STAGE info, DEV debug; `RUST_LOG` overrides.
fn init_logging(scheduler_id: &str, env: Env) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = match env {
        Env::Prod => "warn",
        Env::Stage => "info",
        Env::Dev => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lotcrawl={default_level}")));

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".into());
    std::fs::create_dir_all(&log_dir).context("creating log directory")?;
    let file_name = format!(
        "{}_{}.log",
        scheduler_id.to_uppercase(),
        Local::now().format("%Y-%m-%d_%H-%M")
    );
    let appender = tracing_appender::rolling::never(&log_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    tracing::info!("logging for {scheduler_id} initialized [running in {env} mode]");
    Ok(guard)
}
