//! Progress reporter for batch runs
//!
//! One bar counts finished targets, a spinner line shows the most recent
//! completion. Failures are printed above the bars as they happen.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress reporter for fan-out runs
pub struct ProgressReporter {
    multi: MultiProgress,
    targets_bar: ProgressBar,
    status: ProgressBar,
    start_time: Instant,
    succeeded: AtomicU64,
    failed: AtomicU64,
    enabled: AtomicBool,
}

impl ProgressReporter {
    /// Create a reporter for `total` targets
    pub fn new(total: u64) -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(120));

        let targets_bar = multi.add(ProgressBar::new(total));
        targets_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%, {elapsed_precise}, ETA {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        targets_bar.set_prefix("Targets");

        Self {
            multi,
            targets_bar,
            status,
            start_time: Instant::now(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Reporter that draws nothing (quiet mode, tests)
    pub fn disabled(total: u64) -> Self {
        let reporter = Self::new(total);
        reporter.status.disable_steady_tick();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Record one finished target
    pub fn target_finished(&self, target: &str, success: bool, detail: &str) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            self.status.set_message(format!("✓ {}", target));
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.status.set_message(format!("✗ {}", target));
            if self.is_enabled() {
                let _ = self.multi.println(format!("✗ {}: {}", target, detail));
            }
        }
        self.targets_bar.inc(1);
    }

    /// Finish the bars with a summary line
    pub fn finish(&self) {
        let summary = self.summary();
        let line = format!(
            "{} succeeded, {} failed in {:.1?}",
            summary.succeeded, summary.failed, summary.elapsed
        );
        if summary.failed == 0 {
            self.status.finish_with_message(format!("✓ {}", line));
            self.targets_bar.finish();
        } else {
            self.status.finish_with_message(format!("✗ {}", line));
            self.targets_bar.abandon();
        }
    }

    /// Whether anything is drawn
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Time since the reporter was created
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Counts so far
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            total: self.targets_bar.length().unwrap_or(0),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Targets in the run
    pub total: u64,
    /// Finished successfully
    pub succeeded: u64,
    /// Finished with an error
    pub failed: u64,
    /// Elapsed time
    pub elapsed: Duration,
}

impl ProgressSummary {
    /// Finished targets
    pub fn done(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Completion percentage
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done() as f64 / self.total as f64) * 100.0
        }
    }
}
