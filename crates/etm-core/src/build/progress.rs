//! Progress display for parallel module runs
//!
//! This module provides progress bar functionality using indicatif,
//! integrated with tracing for clean log output.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::report::{StepOutcome, StepResult};

/// Progress manager for a run
///
/// Cloning is cheap; clones share the same bars.
#[derive(Clone)]
pub struct RunProgress {
    /// Multi-progress container for all progress bars
    multi: MultiProgress,
    /// Spinners of in-flight modules indexed by module name
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    /// Main progress bar counting finished steps
    main_bar: ProgressBar,
}

impl RunProgress {
    /// Create a progress display drawing to stderr
    pub fn new(multi: MultiProgress) -> Self {
        let main_bar = multi.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps {msg}")
        {
            main_bar.set_style(style.progress_chars("#>-"));
        }

        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            main_bar,
        }
    }

    /// Create a progress display that draws nothing
    pub fn hidden() -> Self {
        Self::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
    }

    /// Set the number of planned steps and start ticking
    pub fn start(&self, total_steps: usize) {
        self.main_bar.set_length(total_steps as u64);
        self.main_bar.enable_steady_tick(Duration::from_millis(100));
    }

    /// Start working on a module
    pub fn start_module(&self, module: &str) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("  {spinner:.yellow} {msg}") {
            bar.set_style(style);
        }
        bar.set_message(module.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(module.to_string(), bar);
        }
    }

    /// Update the message for a module's spinner
    pub fn update_module(&self, module: &str, message: &str) {
        if let Some(bar) = self.bar(module) {
            bar.set_message(format!("{}: {}", module, message));
        }
    }

    /// Count a finished step
    pub fn step_finished(&self, result: &StepResult) {
        if result.outcome == StepOutcome::Failed {
            self.multi
                .println(format!("  {} {}: FAILED", result.module, result.step))
                .ok();
        }
        self.main_bar.inc(1);
    }

    /// Count steps that were filled in without running
    pub fn steps_skipped(&self, count: usize) {
        self.main_bar.inc(count as u64);
    }

    /// Number of steps counted so far
    pub fn finished_steps(&self) -> u64 {
        self.main_bar.position()
    }

    /// Remove a module's spinner
    pub fn finish_module(&self, module: &str) {
        let bar = self.bars.lock().ok().and_then(|mut bars| bars.remove(module));
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
    }

    /// Finish all progress bars
    ///
    /// The main bar keeps its position, so a run that lost steps shows it.
    pub fn finish(&self, message: &str) {
        if let Ok(mut bars) = self.bars.lock() {
            for (_, bar) in bars.drain() {
                bar.finish_and_clear();
            }
        }
        self.main_bar.abandon_with_message(message.to_string());
    }

    /// Get the multi-progress for integration with tracing
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    fn bar(&self, module: &str) -> Option<ProgressBar> {
        self.bars.lock().ok()?.get(module).cloned()
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new(MultiProgress::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Step;

    #[test]
    fn test_hidden_progress_tracks_modules() {
        let progress = RunProgress::hidden();
        progress.start(3);

        progress.start_module("app");
        progress.update_module("app", "building all");
        assert!(progress.bar("app").is_some());

        progress.step_finished(&StepResult::skipped("app", Step::Configure, 0, "test"));
        progress.finish_module("app");
        assert!(progress.bar("app").is_none());

        assert_eq!(progress.finished_steps(), 1);

        progress.steps_skipped(1);
        assert_eq!(progress.finished_steps(), 2);

        progress.finish("done");
        assert_eq!(progress.finished_steps(), 2);
    }
}
