//! Cooperative cancellation and stage-boundary outcomes
//!
//! A task runs under two bounds: the run-wide stop flag (set by the
//! scheduler on run timeout or by the signal handler) and its own
//! deadline. Neither is preemptive: every pipeline stage checks the
//! context at its boundary and unwinds with `ScrapeError::Stopped`, so a
//! task never dies mid-stage with a half-driven browser.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Shared boolean with a monotone `false → true` transition; set means
/// "drop remaining work as soon as possible".
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether two handles point at the same underlying flag.
    pub fn same_flag(&self, other: &StopFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Why a task was stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The run-wide stop flag was set.
    RunTimeout,
    /// This task exceeded its own process timeout.
    TaskTimeout,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::RunTimeout => f.write_str("run timeout event set"),
            StopReason::TaskTimeout => f.write_str("process timeout reached"),
        }
    }
}

/// Terminal failure kinds: fatal for the task, not the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    InsufficientRecords,
    LowFieldCount,
    MissingConfiguration,
    Navigation,
}

impl std::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalKind::InsufficientRecords => f.write_str("insufficient records"),
            TerminalKind::LowFieldCount => f.write_str("low field count"),
            TerminalKind::MissingConfiguration => f.write_str("missing configuration"),
            TerminalKind::Navigation => f.write_str("navigation failure"),
        }
    }
}

/// Stage-boundary outcome of a scrape. The scheduler reads the variant to
/// decide between retrying, recording a warning, and recording an error.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("scraping stopped: {0}")]
    Stopped(StopReason),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("suspicious record count {found} (average is {expected})")]
    ShapeAnomaly { found: usize, expected: usize },

    #[error("{kind}: {message}")]
    Terminal { kind: TerminalKind, message: String },
}

impl ScrapeError {
    pub fn terminal(kind: TerminalKind, message: impl Into<String>) -> Self {
        ScrapeError::Terminal {
            kind,
            message: message.into(),
        }
    }
}

/// Per-task execution context: the run stop flag plus this task's
/// deadline. Checked at entry to and between every major pipeline pass.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    pub stop: StopFlag,
    pub started: Instant,
    pub deadline: Instant,
}

impl ScrapeContext {
    pub fn new(stop: StopFlag, process_timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            stop,
            started,
            deadline: started + process_timeout,
        }
    }

    /// Unbounded context for debug runs.
    pub fn unbounded() -> Self {
        Self::new(StopFlag::new(), Duration::from_secs(60 * 60 * 24))
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), ScrapeError> {
        if self.stop.is_set() {
            return Err(ScrapeError::Stopped(StopReason::RunTimeout));
        }
        if Instant::now() > self.deadline {
            return Err(ScrapeError::Stopped(StopReason::TaskTimeout));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_transition_is_monotone() {
        let flag = StopFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn checkpoint_fails_once_stopped() {
        let ctx = ScrapeContext::new(StopFlag::new(), Duration::from_secs(60));
        assert!(ctx.checkpoint().is_ok());
        ctx.stop.set();
        assert!(matches!(
            ctx.checkpoint(),
            Err(ScrapeError::Stopped(StopReason::RunTimeout))
        ));
    }

    #[test]
    fn checkpoint_fails_past_deadline() {
        let ctx = ScrapeContext::new(StopFlag::new(), Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            ctx.checkpoint(),
            Err(ScrapeError::Stopped(StopReason::TaskTimeout))
        ));
    }

    #[test]
    fn shared_flag_is_visible_across_clones() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        flag.set();
        assert!(clone.is_set());
    }
}
