//! Worker pool
//!
//! A bounded pool of batch workers, each owning one Chrome process for the
//! batch's lifetime. Submissions are staggered so browsers never cold-start
//! simultaneously; three stacked bounds cut work short (per-task process
//! timeout checked cooperatively inside the scrapers, per-batch timeout on
//! collection, per-run wall clock that trips the shared stop flag). The
//! pool is torn down explicitly at run end: stragglers are aborted, not
//! waited for.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::SchedulerState;
use crate::browser::Driver;
use crate::images::ImageContext;
use crate::scrape::context::{ScrapeContext, ScrapeError};
use crate::scrape::{ScrapeDeps, catalog, detail};
use crate::settings::task::{Batch, ScrapeTask, ScraperKind};
use crate::scrape::StopFlag;

/// Outcome of one pool run.
#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub succeeded: usize,
    pub total: usize,
}

/// Run every batch through a pool of `pool_capacity` workers.
///
/// Failed tasks feed the retry backlog unless `retry_failed` is off
/// (detail runs re-plan tomorrow instead of retrying).
pub async fn run_pool(
    kind: ScraperKind,
    batches: Vec<Batch>,
    state: &Arc<SchedulerState>,
    retry_failed: bool,
) -> PoolOutcome {
    let scheduler = state.settings.scheduler_settings();
    let pool_capacity = scheduler.pool_capacity(kind);
    let run_timeout = scheduler.run_timeout(kind);
    let batch_timeout = scheduler.batch_timeout(kind);
    let stagger = scheduler.startup_stagger(kind);

    let stop = StopFlag::new();
    state.register_run_event(stop.clone());
    let run_start = Instant::now();

    let semaphore = Arc::new(Semaphore::new(pool_capacity));
    let mut active: Vec<(Vec<ScrapeTask>, JoinHandle<Vec<bool>>)> = Vec::new();
    let mut submitted = 0usize;

    for batch in batches {
        if stop.is_set() || run_start.elapsed() > run_timeout {
            warn!("terminating run before all batches were submitted");
            stop.set();
            break;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            error!("worker pool semaphore closed unexpectedly");
            break;
        };

        let tasks = batch.tasks.clone();
        let worker_state = Arc::clone(state);
        let worker_stop = stop.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            batch_scrape(kind, batch, worker_state, worker_stop).await
        });
        active.push((tasks, handle));
        submitted += 1;

        // Stagger cold starts until the pool is saturated.
        if submitted < pool_capacity {
            tokio::time::sleep(stagger).await;
        }
    }

    let mut outcome = PoolOutcome::default();
    let mut timed_out = false;

    for (tasks, mut handle) in active {
        outcome.total += tasks.len();

        if timed_out || run_start.elapsed() > run_timeout {
            if !timed_out {
                warn!("run timeout reached, terminating");
                stop.set();
                timed_out = true;
            }
            handle.abort();
            continue;
        }

        let results = match tokio::time::timeout(batch_timeout, &mut handle).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                error!("batch worker panicked: {e}");
                vec![false; tasks.len()]
            }
            Err(_) => {
                error!("batch timed out after {batch_timeout:?}, marking tasks failed");
                handle.abort();
                vec![false; tasks.len()]
            }
        };

        for (task, success) in tasks.into_iter().zip(results) {
            if success {
                outcome.succeeded += 1;
            } else if retry_failed {
                state.retry.push(task, 1, Instant::now());
            }
        }
    }

    state.unregister_run_event(&stop);
    info!(
        "successfully scraped {} of {} urls in {:.2} hours",
        outcome.succeeded,
        outcome.total,
        run_start.elapsed().as_secs_f64() / 3600.0
    );
    outcome
}

/// One worker: a single driver serves the batch's tasks sequentially,
/// rebuilt if Chrome crashes mid-batch. The stop flag short-circuits every
/// task that has not started yet.
async fn batch_scrape(
    kind: ScraperKind,
    batch: Batch,
    state: Arc<SchedulerState>,
    stop: StopFlag,
) -> Vec<bool> {
    let mut results = vec![false; batch.tasks.len()];
    if stop.is_set() {
        error!("terminating batch before start due to run timeout");
        return results;
    }

    let start = Instant::now();
    info!("starting batch scraping ({} tasks)", batch.tasks.len());
    let browser_settings = state.settings.browser_settings();

    let mut driver: Option<Driver> = None;

    for (i, task) in batch.tasks.iter().enumerate() {
        if stop.is_set() {
            error!("terminating batch due to run timeout");
            break;
        }

        let alive = match &driver {
            Some(d) => d.is_alive().await,
            None => false,
        };
        if !alive {
            if let Some(stale) = driver.take() {
                warn!("driver shut down unexpectedly, restarting");
                stale.quit().await;
            }
            match Driver::launch(batch.proxy.clone(), &browser_settings).await {
                Ok(d) => driver = Some(d),
                Err(e) => {
                    error!("failed to start driver: {e}");
                    break;
                }
            }
        }
        let Some(d) = driver.as_ref() else { break };

        let mut task = task.clone();
        task.proxy = batch.proxy.clone();
        results[i] = run_task(kind, d, &task, &state, &stop).await;
    }

    if let Some(d) = driver {
        d.quit().await;
    }
    info!("batch time: {:.3}s", start.elapsed().as_secs_f64());
    results
}

/// Execute one task end to end, including persistence. Never panics the
/// worker; every failure path records a scrape row and returns `false`.
pub async fn run_task(
    kind: ScraperKind,
    driver: &Driver,
    task: &ScrapeTask,
    state: &Arc<SchedulerState>,
    stop: &StopFlag,
) -> bool {
    let process_timeout = state.settings.scheduler_settings().process_timeout(kind);
    run_task_with_timeout(kind, driver, task, state, stop, process_timeout).await
}

/// Like [`run_task`], but under an explicit process timeout (the retry
/// pass carries its own budget).
pub async fn run_task_with_timeout(
    kind: ScraperKind,
    driver: &Driver,
    task: &ScrapeTask,
    state: &Arc<SchedulerState>,
    stop: &StopFlag,
    process_timeout: std::time::Duration,
) -> bool {
    let ctx = ScrapeContext::new(stop.clone(), process_timeout);

    match kind {
        ScraperKind::Vdp => run_detail_task(driver, task, &ctx, state).await,
        _ => run_catalog_task(kind, driver, task, &ctx, state).await,
    }
}

async fn run_catalog_task(
    kind: ScraperKind,
    driver: &Driver,
    task: &ScrapeTask,
    ctx: &ScrapeContext,
    state: &Arc<SchedulerState>,
) -> bool {
    let start = Instant::now();
    let settings = &state.settings;
    let rules = settings.attribute_rules(ScraperKind::Catalog);
    let cleaner = settings.cleaner_settings(kind);
    let catalog_settings = settings.catalog_settings();
    let pagination = settings.pagination_settings();
    let browser = settings.browser_settings();
    let vdp = settings.vdp_settings();
    let (max_label_distance, max_tag_distance) = settings.distances(kind);

    let images = if catalog_settings.hash_record_images || catalog_settings.upload_record_images {
        let with_images: HashSet<String> = state
            .store
            .get_records_with_images(
                task,
                catalog_settings.upload_record_images,
                catalog_settings.hash_record_images,
            )
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        let default_hashes: HashSet<String> = state
            .store
            .get_default_image_hashes()
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        ImageContext::new(driver.user_agent().await, default_hashes, with_images, true)
    } else {
        ImageContext::disabled()
    };

    let deps = ScrapeDeps {
        rules: &rules,
        tables: state.tables.as_ref(),
        cleaner: &cleaner,
        pagination: &pagination,
        browser: &browser,
        catalog: &catalog_settings,
        vdp: &vdp,
        images: &images,
        max_label_distance,
        max_tag_distance,
        tree_dump_dir: state.tree_dump_dir.clone(),
    };

    let outcome = catalog::scrape(driver, task, ctx, &deps).await;
    let elapsed = start.elapsed().as_secs_f64();

    match outcome {
        Ok(outcome) => {
            if let Some(png) = &outcome.screenshot
                && let Err(e) = state.blob.save_screenshot(task, png).await
            {
                warn!("failed to store screenshot for {}: {e}", task.describe());
            }
            persist_catalog_outcome(state, task, outcome, elapsed, &catalog_settings)
                .await
                .unwrap_or_else(|e| {
                    error!("error saving catalog scrape {}: {e}", task.describe());
                    false
                })
        }
        Err(e) => {
            record_scrape_error(state, task, &e, elapsed).await;
            false
        }
    }
}

async fn persist_catalog_outcome(
    state: &Arc<SchedulerState>,
    task: &ScrapeTask,
    outcome: catalog::CatalogOutcome,
    elapsed: f64,
    catalog_settings: &crate::settings::CatalogSettings,
) -> anyhow::Result<bool> {
    let db_start = Instant::now();
    let pages = outcome.pages;
    let mut records = outcome.records;
    info!("persisting {} records found across {pages} pages", records.len());

    let session_id = state
        .store
        .save_scrape(task, Some(records.len()), "Saving record data", elapsed)
        .await?;

    // Upload downloaded record images; the stored link points at the blob.
    for record in &mut records {
        let Some(image) = record.image.clone() else { continue };
        let Some(alias) = record.alias.as_deref() else { continue };
        match state.blob.save_record_image(alias, &image).await {
            Ok(Some(stored)) => record.image_link = Some(stored),
            Ok(None) => {}
            Err(e) => error!("error while saving record image for {alias}: {e}"),
        }
    }

    state.store.save_records(&records, task, session_id).await?;

    let average = state
        .store
        .get_average_count(&task.url, catalog_settings.record_count_warning)
        .await
        .unwrap_or(None);

    let success = match assess_record_count(records.len(), average, catalog_settings.retry_difference)
    {
        Some(expected) => {
            let anomaly = ScrapeError::ShapeAnomaly {
                found: records.len(),
                expected,
            };
            state
                .store
                .update_scrape(session_id, Some(records.len()), &format!("Warning: {anomaly}"), elapsed)
                .await?;
            false
        }
        None => {
            state
                .store
                .update_scrape(session_id, Some(records.len()), "Success", elapsed)
                .await?;
            true
        }
    };

    info!("database save time: {:.3}s", db_start.elapsed().as_secs_f64());
    info!("total time: {elapsed:.3}s");
    Ok(success)
}

/// A found count deviating from the weekly average by more than the
/// configured fraction is suspicious; returns the expected count.
pub fn assess_record_count(
    found: usize,
    average: Option<i64>,
    retry_difference: f64,
) -> Option<usize> {
    let average = average? as f64;
    if (average - found as f64).abs() > average * retry_difference {
        Some(average as usize)
    } else {
        None
    }
}

async fn run_detail_task(
    driver: &Driver,
    task: &ScrapeTask,
    ctx: &ScrapeContext,
    state: &Arc<SchedulerState>,
) -> bool {
    let start = Instant::now();
    let settings = &state.settings;
    let rules = settings.attribute_rules(ScraperKind::Vdp);
    let cleaner = settings.cleaner_settings(ScraperKind::Vdp);
    let catalog_settings = settings.catalog_settings();
    let pagination = settings.pagination_settings();
    let browser = settings.browser_settings();
    let vdp = settings.vdp_settings();
    let (max_label_distance, max_tag_distance) = settings.distances(ScraperKind::Vdp);
    let images = ImageContext::disabled();

    let deps = ScrapeDeps {
        rules: &rules,
        tables: state.tables.as_ref(),
        cleaner: &cleaner,
        pagination: &pagination,
        browser: &browser,
        catalog: &catalog_settings,
        vdp: &vdp,
        images: &images,
        max_label_distance,
        max_tag_distance,
        tree_dump_dir: state.tree_dump_dir.clone(),
    };

    let outcome = detail::scrape(driver, task, ctx, &deps).await;
    let elapsed = start.elapsed().as_secs_f64();

    match outcome {
        Ok(record) => {
            let result: anyhow::Result<()> = async {
                let session_id = state
                    .store
                    .save_scrape(task, Some(1), "Saving record data", elapsed)
                    .await?;
                state.store.save_or_update_detail(&record).await?;
                state
                    .store
                    .update_scrape(session_id, Some(record.found_count), "Success", elapsed)
                    .await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => {
                    info!("total time: {elapsed:.3}s");
                    true
                }
                Err(e) => {
                    error!("error saving detail scrape {}: {e}", task.describe());
                    false
                }
            }
        }
        Err(e) => {
            record_scrape_error(state, task, &e, elapsed).await;
            false
        }
    }
}

/// Record a failed scrape on its session row; the message leads with
/// `Error:` so downstream reporting can tell failures from warnings.
async fn record_scrape_error(
    state: &Arc<SchedulerState>,
    task: &ScrapeTask,
    error: &ScrapeError,
    elapsed: f64,
) {
    error!("error scraping {}: {error}", task.describe());
    if let Err(e) = state
        .store
        .save_scrape(task, None, &format!("Error: {error}"), elapsed)
        .await
    {
        error!("could not record scrape error for {}: {e}", task.describe());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_near_the_average_pass() {
        assert_eq!(assess_record_count(95, Some(100), 0.5), None);
        assert_eq!(assess_record_count(51, Some(100), 0.5), None);
    }

    #[test]
    fn deviant_counts_are_flagged() {
        assert_eq!(assess_record_count(12, Some(100), 0.5), Some(100));
        assert_eq!(assess_record_count(300, Some(100), 0.5), Some(100));
    }

    #[test]
    fn no_average_means_no_verdict() {
        assert_eq!(assess_record_count(12, None, 0.5), None);
    }
}
