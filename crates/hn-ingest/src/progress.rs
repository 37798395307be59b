//! Progress events for an external display
//!
//! Events are one-way: the pipeline never waits on a reporter or reads
//! anything back from it.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hn_common::format_count;

pub trait ProgressReporter: Send + Sync {
    /// The id range `start..=end` was resolved
    fn run_started(&self, _start: i64, _end: i64) {}

    /// A physical request attempt started
    fn connection_started(&self) {}

    /// A physical request attempt ended, successfully or not
    fn connection_ended(&self) {}

    /// Fetching ids `start..end` began
    fn batch_started(&self, _start: i64, _end: i64) {}

    /// One id resolved; `had_data` is false for absent items
    fn item_completed(&self, _had_data: bool) {}

    fn run_finished(&self) {}
}

/// Reporter that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {}

pub type SharedReporter = Arc<dyn ProgressReporter>;

pub fn noop() -> SharedReporter {
    Arc::new(NoopReporter)
}

/// Terminal display: an overall bar plus a status line
pub struct ConsoleProgress {
    _multi: MultiProgress,
    overall: ProgressBar,
    status: ProgressBar,
    max_connections: usize,
    active: AtomicUsize,
    completed: AtomicU64,
    with_data: AtomicU64,
    batch_start: AtomicI64,
    batch_end: AtomicI64,
    started: Instant,
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn status_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl ConsoleProgress {
    pub fn new(max_connections: usize) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(0));
        overall.set_style(bar_style());
        overall.enable_steady_tick(Duration::from_millis(120));

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(status_style());

        Self {
            _multi: multi,
            overall,
            status,
            max_connections,
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            with_data: AtomicU64::new(0),
            batch_start: AtomicI64::new(0),
            batch_end: AtomicI64::new(0),
            started: Instant::now(),
        }
    }

    fn refresh(&self) {
        let completed = self.completed.load(Ordering::Relaxed);
        let with_data = self.with_data.load(Ordering::Relaxed);
        let hit_rate = if completed == 0 {
            0.0
        } else {
            with_data as f64 / completed as f64 * 100.0
        };
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);

        self.status.set_message(format!(
            "batch {}..{} | connections {}/{} | hit rate {:.1}% | {:.0} items/s",
            format_count(self.batch_start.load(Ordering::Relaxed)),
            format_count(self.batch_end.load(Ordering::Relaxed)),
            self.active.load(Ordering::Relaxed),
            self.max_connections,
            hit_rate,
            completed as f64 / elapsed,
        ));
    }
}

impl ProgressReporter for ConsoleProgress {
    fn run_started(&self, start: i64, end: i64) {
        self.overall.set_length((end - start + 1).max(0) as u64);
        self.overall.set_position(0);
        self.refresh();
    }

    fn connection_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_ended(&self) {
        // Never below zero
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn batch_started(&self, start: i64, end: i64) {
        self.batch_start.store(start, Ordering::Relaxed);
        self.batch_end.store(end, Ordering::Relaxed);
        self.refresh();
    }

    fn item_completed(&self, had_data: bool) {
        self.overall.inc(1);
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if had_data {
            self.with_data.fetch_add(1, Ordering::Relaxed);
        }
        if completed % 64 == 0 {
            self.refresh();
        }
    }

    fn run_finished(&self) {
        self.status.finish_and_clear();
        self.overall.finish_and_clear();
    }
}
