//! Retry backlog
//!
//! Tasks that failed their run accumulate here with an attempt count and
//! the time of their first failure. An hourly pass drains the backlog one
//! task at a time in a single-worker pool: stale tasks are dropped, and
//! the pass yields entirely when the next scheduled run is already due.
//! Every retried task records its own outcome: nothing leaks between
//! iterations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveTime, TimeDelta};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{SchedulerState, pool};
use crate::browser::Driver;
use crate::scrape::StopFlag;
use crate::settings::task::{ScrapeTask, ScraperKind};

/// One backlog entry.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub task: ScrapeTask,
    pub attempts: u32,
    pub first_attempt: Instant,
}

/// Process-wide backlog of failed tasks.
#[derive(Default)]
pub struct RetryQueue {
    entries: Mutex<Vec<RetryEntry>>,
}

impl RetryQueue {
    pub fn push(&self, task: ScrapeTask, attempts: u32, first_attempt: Instant) {
        self.entries.lock().push(RetryEntry {
            task,
            attempts,
            first_attempt,
        });
    }

    pub fn requeue(&self, entry: RetryEntry) {
        self.entries.lock().push(entry);
    }

    pub fn take_all(&self) -> Vec<RetryEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The hourly retry pass.
pub async fn retry_failed_scrapes(state: Arc<SchedulerState>) {
    if state.retry.is_empty() {
        info!("no failed scrapes to retry");
        return;
    }

    let scheduler = state.settings.scheduler_settings();
    let max_retry = Duration::from_secs(scheduler.max_retry_hours * 3600);
    let next_task_time = next_scrape_time(&state);

    info!(
        "retrying {} failed scrapes after {} minutes",
        state.retry.len(),
        scheduler.retry_startup_time_minutes
    );
    tokio::time::sleep(Duration::from_secs(scheduler.retry_startup_time_minutes * 60)).await;

    let entries = state.retry.take_all();
    let stop = StopFlag::new();

    for entry in entries {
        if entry.first_attempt.elapsed() > max_retry {
            warn!(
                "skipping retry for {} because it has become stale after {} hours",
                entry.task.describe(),
                scheduler.max_retry_hours
            );
            continue;
        }

        if stop.is_set()
            || next_task_time
                .map(|next| Local::now() > next)
                .unwrap_or(false)
        {
            warn!("skipping retry for {} due to next task", entry.task.describe());
            stop.set();
            state.retry.requeue(entry);
            continue;
        }

        let success = if entry.attempts < scheduler.retry_attempts + 1 {
            retry_scrape(&state, &entry, &stop).await
        } else {
            false
        };

        if !success && entry.attempts < scheduler.retry_attempts + 1 {
            state
                .retry
                .push(entry.task, entry.attempts + 1, entry.first_attempt);
        }

        tokio::time::sleep(Duration::from_secs(scheduler.retry_wait_time_minutes * 60)).await;
    }
}

/// One retry in a single-worker pool with its own process timeout; the
/// proxy is dropped so a dead exit cannot fail the task twice.
async fn retry_scrape(state: &Arc<SchedulerState>, entry: &RetryEntry, stop: &StopFlag) -> bool {
    let scheduler = state.settings.scheduler_settings();
    let browser_settings = state.settings.browser_settings();

    let mut task = entry.task.clone();
    task.proxy = None;

    let driver = match Driver::launch(None, &browser_settings).await {
        Ok(driver) => driver,
        Err(e) => {
            error!("failed to start driver for retry: {e}");
            return false;
        }
    };

    let success = pool::run_task_with_timeout(
        task.kind,
        &driver,
        &task,
        state,
        stop,
        Duration::from_secs(scheduler.retry_process_timeout_minutes * 60),
    )
    .await;

    driver.quit().await;
    success
}

/// The earlier of the next scheduled catalog and detail run times.
pub fn next_scrape_time(state: &Arc<SchedulerState>) -> Option<DateTime<Local>> {
    let scheduler = state.settings.scheduler_settings();
    let catalog = scheduler
        .scheduled_time(ScraperKind::Catalog, state.env)
        .and_then(|t| next_occurrence(t));
    let vdp = scheduler
        .scheduled_time(ScraperKind::Vdp, state.env)
        .and_then(|t| next_occurrence(t));

    match (catalog, vdp) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => {
            info!("no next scrape time found");
            None
        }
    }
}

/// Next wall-clock occurrence of an `HH:MM` time.
pub fn next_occurrence(time: &str) -> Option<DateTime<Local>> {
    let parsed = NaiveTime::parse_from_str(time, "%H:%M").ok()?;
    let now = Local::now();
    let mut next = now.with_time(parsed).single()?;
    if next < now {
        next += TimeDelta::days(1);
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::task::TaskConfig;

    fn sample_task() -> ScrapeTask {
        ScrapeTask::new(
            ScraperKind::Catalog,
            "a",
            "lv",
            "https://a.example/",
            TaskConfig::default(),
            0,
        )
    }

    #[test]
    fn queue_drains_and_requeues() {
        let queue = RetryQueue::default();
        assert!(queue.is_empty());

        queue.push(sample_task(), 1, Instant::now());
        assert_eq!(queue.len(), 1);

        let drained = queue.take_all();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());

        queue.requeue(drained.into_iter().next().expect("entry present"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stale_entries_are_detectable() {
        let Some(first_attempt) = Instant::now().checked_sub(Duration::from_secs(3)) else {
            return;
        };
        let stale = RetryEntry {
            task: sample_task(),
            attempts: 1,
            first_attempt,
        };
        assert!(stale.first_attempt.elapsed() > Duration::from_secs(1));
    }

    #[test]
    fn next_occurrence_is_in_the_future() {
        let next = next_occurrence("00:00").expect("parses");
        assert!(next >= Local::now() - TimeDelta::minutes(1));
        assert!(next_occurrence("not a time").is_none());
    }
}
