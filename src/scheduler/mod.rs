//! Scheduler
//!
//! The long-running daemon: daily catalog and detail runs, a daily
//! cleanup, an hourly retry pass, and a four-hour heartbeat. All mutable
//! cross-run state (active stop flags, the retry backlog) hangs off one
//! `SchedulerState` so the signal handler has a single hook to pull.

pub mod pool;
pub mod retry;
pub mod work;

pub use pool::{PoolOutcome, run_pool};
pub use retry::{RetryQueue, retry_failed_scrapes};
pub use work::{batch_tasks, build_catalog_tasks, interleave_tasks};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::browser::Driver;
use crate::images::BlobStore;
use crate::scrape::StopFlag;
use crate::settings::task::{ScrapeTask, ScraperKind, TaskConfig};
use crate::settings::{Env, SettingsStore, TableCache};
use crate::store::Store;

/// Shared daemon state.
pub struct SchedulerState {
    pub settings: Arc<SettingsStore>,
    pub store: Arc<Store>,
    pub tables: Arc<TableCache>,
    pub blob: BlobStore,
    pub retry: RetryQueue,
    pub env: Env,
    pub startup: DateTime<Local>,
    /// Dump directory for intermediate trees (debug runs only).
    pub tree_dump_dir: Option<PathBuf>,
    run_events: Mutex<Vec<StopFlag>>,
}

impl SchedulerState {
    pub fn new(
        settings: Arc<SettingsStore>,
        store: Arc<Store>,
        tables: Arc<TableCache>,
        blob: BlobStore,
        env: Env,
    ) -> Self {
        Self {
            settings,
            store,
            tables,
            blob,
            retry: RetryQueue::default(),
            env,
            startup: Local::now(),
            tree_dump_dir: None,
            run_events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register_run_event(&self, flag: StopFlag) {
        self.run_events.lock().push(flag);
    }

    pub(crate) fn unregister_run_event(&self, flag: &StopFlag) {
        self.run_events.lock().retain(|f| !f.same_flag(flag));
    }

    /// Trip every active run's stop flag; workers observe it at their next
    /// suspension point.
    pub fn clear_run_events(&self) {
        for event in self.run_events.lock().drain(..) {
            info!("setting stop event for an active run");
            event.set();
        }
    }
}

/// One full catalog run over all configured targets.
pub async fn run_catalog_scraping(state: Arc<SchedulerState>) {
    info!("starting catalog scraping");
    if let Err(e) = catalog_run(&state).await {
        error!("catalog run failed: {e:#}");
    }
}

async fn catalog_run(state: &Arc<SchedulerState>) -> Result<()> {
    let run_id = state
        .store
        .save_run(&state.settings.scheduler_id, ScraperKind::Catalog)
        .await?;

    let proxies = state.store.get_proxies().await.unwrap_or_default();
    let targets = state.settings.target_domains();
    let tasks_by_domain = work::build_catalog_tasks(targets, &proxies, run_id);
    let tasks = work::interleave_tasks(tasks_by_domain);

    let scheduler = state.settings.scheduler_settings();
    let batches = work::batch_tasks(
        tasks,
        scheduler.batch_size(ScraperKind::Catalog),
        scheduler.pool_capacity(ScraperKind::Catalog),
        &proxies,
    );

    pool::run_pool(ScraperKind::Catalog, batches, state, true).await;
    state.store.end_run(run_id).await?;
    Ok(())
}

/// One full detail run: the four priority subsets, each interleaved
/// across domains, concatenated in priority order. Detail failures are not
/// retried: they reappear on tomorrow's run.
pub async fn run_detail_scraping(state: Arc<SchedulerState>) {
    info!("starting detail scraping");
    if let Err(e) = detail_run(&state).await {
        error!("detail run failed: {e:#}");
    }
}

async fn detail_run(state: &Arc<SchedulerState>) -> Result<()> {
    let run_id = state
        .store
        .save_run(&state.settings.scheduler_id, ScraperKind::Vdp)
        .await?;

    let scheduler = state.settings.scheduler_settings();
    let scheduler_id = &state.settings.scheduler_id;

    let priority = state
        .store
        .detail_priority_targets(scheduler_id, run_id, scheduler.vdp_backlog_interval_days)
        .await?;
    let competitor = state
        .store
        .detail_competitor_backlog_targets(
            scheduler_id,
            run_id,
            scheduler.vdp_backlog_interval_days,
            &scheduler.platform_domains,
        )
        .await?;
    let inconclusive = state
        .store
        .detail_inconclusive_targets(scheduler_id, run_id)
        .await?;
    let platform = state
        .store
        .detail_platform_backlog_targets(
            scheduler_id,
            run_id,
            scheduler.vdp_backlog_interval_days,
            &scheduler.platform_domains,
        )
        .await?;

    let mut tasks = work::interleave_tasks(priority);
    tasks.extend(work::interleave_tasks(competitor));
    tasks.extend(work::interleave_tasks(inconclusive));
    tasks.extend(work::interleave_tasks(platform));

    let proxies = state.store.get_proxies().await.unwrap_or_default();
    let batches = work::batch_tasks(
        tasks,
        scheduler.batch_size(ScraperKind::Vdp),
        scheduler.pool_capacity(ScraperKind::Vdp),
        &proxies,
    );
    info!("scraping {} detail batches on run {run_id}", batches.len());

    pool::run_pool(ScraperKind::Vdp, batches, state, false).await;
    state.store.end_run(run_id).await?;
    Ok(())
}

/// Terminate leftover browser processes and clear scraper temp
/// directories. Destructive, so DEV skips it.
pub async fn cleanup(state: Arc<SchedulerState>) {
    info!("cleanup started");
    if state.env == Env::Dev {
        info!("skipping cleanup in dev environment");
        return;
    }

    for process in ["chrome", "chromium", "chromedriver"] {
        match tokio::process::Command::new("pkill")
            .arg("-f")
            .arg(process)
            .status()
            .await
        {
            Ok(status) => info!("pkill {process} exited with {status}"),
            Err(e) => warn!("failed to kill {process} processes: {e}"),
        }
    }

    let temp = std::env::temp_dir();
    if let Ok(mut entries) = tokio::fs::read_dir(&temp).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("lotcrawl_chrome_")
                && let Err(e) = tokio::fs::remove_dir_all(entry.path()).await
            {
                warn!("failed to clean up {}: {e}", entry.path().display());
            }
        }
    }

    info!("cleanup done");
}

pub fn log_heartbeat() {
    info!("scheduler waiting for tasks");
}

fn cron_for(time: &str) -> Option<String> {
    let (hours, minutes) = time.split_once(':')?;
    let hours: u8 = hours.trim().parse().ok()?;
    let minutes: u8 = minutes.trim().parse().ok()?;
    Some(format!("0 {minutes} {hours} * * *"))
}

/// Run the scheduler daemon until a termination signal arrives. Exits the
/// process with `-1` on signal, after tripping every active run's stop
/// flag.
pub async fn run_scheduler(state: Arc<SchedulerState>) -> Result<()> {
    let scheduler_settings = state.settings.scheduler_settings();
    let sched = JobScheduler::new().await.context("creating job scheduler")?;

    if let Some(time) = scheduler_settings.scheduled_time(ScraperKind::Catalog, state.env)
        && let Some(cron) = cron_for(time)
    {
        let job_state = Arc::clone(&state);
        let job = Job::new_async(cron.as_str(), move |_id, _lock| {
            let state = Arc::clone(&job_state);
            Box::pin(async move {
                run_catalog_scraping(state).await;
            })
        })
        .context("creating catalog job")?;
        sched.add(job).await.context("adding catalog job")?;
    }

    if let Some(time) = scheduler_settings.scheduled_time(ScraperKind::Vdp, state.env)
        && let Some(cron) = cron_for(time)
    {
        let job_state = Arc::clone(&state);
        let job = Job::new_async(cron.as_str(), move |_id, _lock| {
            let state = Arc::clone(&job_state);
            Box::pin(async move {
                run_detail_scraping(state).await;
            })
        })
        .context("creating detail job")?;
        sched.add(job).await.context("adding detail job")?;
    }

    if let Some(time) = scheduler_settings.scheduled_cleanup_time.get(state.env.as_str())
        && let Some(cron) = cron_for(time)
    {
        let job_state = Arc::clone(&state);
        let job = Job::new_async(cron.as_str(), move |_id, _lock| {
            let state = Arc::clone(&job_state);
            Box::pin(async move {
                cleanup(state).await;
            })
        })
        .context("creating cleanup job")?;
        sched.add(job).await.context("adding cleanup job")?;
    }

    let retry_state = Arc::clone(&state);
    let retry_job = Job::new_async("0 0 * * * *", move |_id, _lock| {
        let state = Arc::clone(&retry_state);
        Box::pin(async move {
            retry::retry_failed_scrapes(state).await;
        })
    })
    .context("creating retry job")?;
    sched.add(retry_job).await.context("adding retry job")?;

    let heartbeat_job = Job::new_async("0 0 */4 * * *", move |_id, _lock| {
        Box::pin(async move {
            log_heartbeat();
        })
    })
    .context("creating heartbeat job")?;
    sched.add(heartbeat_job).await.context("adding heartbeat job")?;

    sched.start().await.context("starting job scheduler")?;

    // Startup work runs in the background so signals stay responsive.
    let startup_state = Arc::clone(&state);
    tokio::spawn(async move {
        let settings = startup_state.settings.scheduler_settings();
        let dev = startup_state.env == Env::Dev;

        if settings.cleanup_on_startup {
            cleanup(Arc::clone(&startup_state)).await;
        }
        if settings.scrape_catalog_on_startup || dev {
            run_catalog_scraping(Arc::clone(&startup_state)).await;
        }
        if settings.scrape_vdp_on_startup || dev {
            run_detail_scraping(Arc::clone(&startup_state)).await;
        }
        info!("scheduler started");
    });

    wait_for_termination().await;
    info!("scheduler stopped by signal");
    state.clear_run_events();
    std::process::exit(-1);
}

async fn wait_for_termination() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for SIGINT: {e}");
                std::future::pending::<()>().await;
            }
        }
        () = sigterm => {}
    }
}

/// One-shot pass for a single URL; used by the `debug-run` entry point.
pub async fn debug_run(
    state: Arc<SchedulerState>,
    kind: ScraperKind,
    domain: &str,
    locale: &str,
    url: &str,
    config: TaskConfig,
    run_id: i64,
) -> Result<()> {
    let proxies = state.store.get_proxies().await.unwrap_or_default();
    let mut task = ScrapeTask::new(kind, domain, locale, url, config, run_id);
    task.proxy = proxies.first().cloned();

    info!(
        "debug run: {} config: {:?} run id: {run_id} proxy: {:?}",
        task.describe(),
        task.config,
        task.proxy.as_ref().map(|p| p.to_string())
    );

    let browser_settings = state.settings.browser_settings();
    let driver = Driver::launch(task.proxy.clone(), &browser_settings)
        .await
        .context("launching driver for debug run")?;

    let stop = StopFlag::new();
    let success = pool::run_task_with_timeout(
        kind,
        &driver,
        &task,
        &state,
        &stop,
        Duration::from_secs(3 * 3600),
    )
    .await;
    driver.quit().await;

    info!("debug run finished, success: {success}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expressions_come_from_wall_clock_times() {
        assert_eq!(cron_for("03:30").as_deref(), Some("0 30 3 * * *"));
        assert_eq!(cron_for("23:05").as_deref(), Some("0 5 23 * * *"));
        assert_eq!(cron_for("nonsense"), None);
    }
}
