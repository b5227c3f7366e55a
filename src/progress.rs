//! Progress bars for long-running CLI operations
//!
//! Optimizer sweeps report every finished trial; data fetches and scoring use
//! a spinner.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

use crate::optimization::TrialOutcome;

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Progress over the trials of a parameter sweep. Safe to update from worker threads.
pub struct OptimizationProgress {
    pub progress: ProgressBar,
    best_roi: Mutex<Option<f64>>,
    failed: Mutex<usize>,
}

impl OptimizationProgress {
    pub fn new(total_trials: usize) -> Self {
        let progress = ProgressBar::new(total_trials as u64);
        progress.set_style(bar_style(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})\n{msg}",
        ));
        Self {
            progress,
            best_roi: Mutex::new(None),
            failed: Mutex::new(0),
        }
    }

    /// Hidden bar, for tests and non-interactive runs
    pub fn hidden(total_trials: usize) -> Self {
        let progress = Self::new(total_trials);
        progress.progress.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        progress
    }

    pub fn on_trial(&self, outcome: &TrialOutcome) {
        let (tp, gs) = outcome.params();
        match outcome.result() {
            Some(result) => {
                let mut best = self.best_roi.lock().unwrap_or_else(|p| p.into_inner());
                if best.map_or(true, |b| result.roi > b) {
                    *best = Some(result.roi);
                }
            }
            None => *self.failed.lock().unwrap_or_else(|p| p.into_inner()) += 1,
        }
        let best = *self.best_roi.lock().unwrap_or_else(|p| p.into_inner());
        let failed = *self.failed.lock().unwrap_or_else(|p| p.into_inner());
        self.progress.inc(1);
        self.progress.set_message(format!(
            "🎯 Best ROI: {} | Failed: {} | Last: tp={:.4} gs={:.4}",
            best.map_or_else(|| "-".to_string(), |r| format!("{:.2}%", r * 100.0)),
            failed,
            tp,
            gs
        ));
    }

    pub fn trials_done(&self) -> u64 {
        self.progress.position()
    }

    pub fn finish(&self, best_roi: Option<f64>) {
        let message = match best_roi {
            Some(roi) => format!("✅ Optimization complete! Best ROI: {:.2}%", roi * 100.0),
            None => "⚠️  Optimization complete, no trial met the drawdown ceiling".to_string(),
        };
        self.progress.finish_with_message(message);
    }

    pub fn finish_with_error(&self, error: &str) {
        self.progress.abandon_with_message(format!("❌ Failed: {}", error));
    }
}

/// Spinner for quick operations
pub struct Spinner {
    pub spinner: ProgressBar,
}

impl Spinner {
    pub fn new(message: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message(message.to_string());
        Self { spinner }
    }

    pub fn update(&self, message: &str) {
        self.spinner.set_message(message.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.spinner.finish_with_message(format!("✅ {}", message));
    }

    pub fn finish_with_error(&self, message: &str) {
        self.spinner.finish_with_message(format!("❌ {}", message));
    }
}
