//! Step results and run report aggregation

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// One unit of work within a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Step {
    /// Generating the module's build directory
    Configure,
    /// Running a named build target
    Target(String),
}

impl Step {
    /// Target name, or `None` for the configure step
    pub fn target(&self) -> Option<&str> {
        match self {
            Step::Configure => None,
            Step::Target(name) => Some(name.as_str()),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Configure => write!(f, "<configure>"),
            Step::Target(name) => write!(f, "{}", name),
        }
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Succeeded => write!(f, "ok"),
            StepOutcome::Failed => write!(f, "FAILED"),
            StepOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of a configure or target step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    /// Module the step belongs to
    pub module: String,
    /// Which step ran
    pub step: Step,
    /// Position within the module: 0 for configure, then resolved target order
    pub position: usize,
    /// Outcome tag
    pub outcome: StepOutcome,
    /// Process exit code; `None` when the process never exited normally
    pub exit_code: Option<i32>,
    /// Wall-clock duration
    pub duration: Duration,
    /// Combined stdout and stderr
    pub output: String,
    /// Why the step failed or was skipped, beyond the exit code
    pub reason: Option<String>,
    /// When the step started; `None` for skipped steps
    pub started_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A step that was never attempted
    pub fn skipped(module: &str, step: Step, position: usize, reason: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            step,
            position,
            outcome: StepOutcome::Skipped,
            exit_code: None,
            duration: Duration::ZERO,
            output: String::new(),
            reason: Some(reason.into()),
            started_at: None,
        }
    }

    /// A step that failed without running a process
    pub fn failed(module: &str, step: Step, position: usize, reason: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            step,
            position,
            outcome: StepOutcome::Failed,
            exit_code: None,
            duration: Duration::ZERO,
            output: String::new(),
            reason: Some(reason.into()),
            started_at: Some(Utc::now()),
        }
    }

    /// A step satisfied by earlier work, such as an existing build directory
    pub fn reused(module: &str, step: Step, position: usize, reason: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Succeeded,
            started_at: Some(Utc::now()),
            ..Self::skipped(module, step, position, reason)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == StepOutcome::Failed
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// No step failed
    AllSucceeded,
    /// At least one step failed, and every planned module was started
    PartialFailure,
    /// Fail-fast stopped the run before some module started
    Aborted,
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::AllSucceeded => 0,
            RunOutcome::PartialFailure | RunOutcome::Aborted => 1,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::AllSucceeded => write!(f, "all succeeded"),
            RunOutcome::PartialFailure => write!(f, "partial failure"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final, ordered report of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Steps sorted by module name, then position
    pub steps: Vec<StepResult>,
    /// Overall outcome
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Steps that failed
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.is_failed())
    }

    /// Steps belonging to `module`
    pub fn module_steps<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a StepResult> {
        self.steps.iter().filter(move |s| s.module == module)
    }

    /// Number of steps with the given outcome
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Collects step results as they arrive from module workers
///
/// Arrival order does not matter: the finished report is sorted.
#[derive(Debug)]
pub struct Aggregator {
    /// Planned steps per module, used to account for work that never reported
    planned: BTreeMap<String, Vec<Step>>,
    recorded: BTreeMap<(String, usize), StepResult>,
    unstarted: BTreeSet<String>,
    keep_going: bool,
    started_at: DateTime<Utc>,
}

impl Aggregator {
    /// Create an aggregator for a run
    pub fn new(keep_going: bool) -> Self {
        Self {
            planned: BTreeMap::new(),
            recorded: BTreeMap::new(),
            unstarted: BTreeSet::new(),
            keep_going,
            started_at: Utc::now(),
        }
    }

    /// Register the steps a module is expected to produce
    pub fn plan_module(&mut self, module: &str, steps: Vec<Step>) {
        self.planned.insert(module.to_string(), steps);
    }

    /// Record a completed step
    pub fn record(&mut self, result: StepResult) {
        let key = (result.module.clone(), result.position);
        if self.recorded.insert(key, result).is_some() {
            tracing::warn!("Duplicate step result replaced an earlier one");
        }
    }

    /// Mark a planned module as never dispatched; its steps become skipped
    ///
    /// Returns the number of steps filled in.
    pub fn record_unstarted(&mut self, module: &str, reason: &str) -> usize {
        self.unstarted.insert(module.to_string());
        self.fill_missing(module, StepOutcome::Skipped, reason)
    }

    /// Fill any planned step of `module` that has not reported
    ///
    /// Returns the number of steps filled in.
    pub fn fill_missing(&mut self, module: &str, outcome: StepOutcome, reason: &str) -> usize {
        let Some(steps) = self.planned.get(module) else {
            return 0;
        };
        let missing: Vec<(usize, Step)> = steps
            .iter()
            .enumerate()
            .filter(|(position, _)| !self.recorded.contains_key(&(module.to_string(), *position)))
            .map(|(position, step)| (position, step.clone()))
            .collect();

        let filled = missing.len();
        for (position, step) in missing {
            let result = match outcome {
                StepOutcome::Failed => StepResult::failed(module, step, position, reason),
                _ => StepResult::skipped(module, step, position, reason),
            };
            self.record(result);
        }
        filled
    }

    /// Number of results recorded so far
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// Finish aggregation once no further work is pending
    pub fn finalize(self) -> RunReport {
        let steps: Vec<StepResult> = self.recorded.into_values().collect();
        let any_failed = steps.iter().any(StepResult::is_failed);

        let outcome = if !any_failed {
            RunOutcome::AllSucceeded
        } else if !self.keep_going && !self.unstarted.is_empty() {
            RunOutcome::Aborted
        } else {
            RunOutcome::PartialFailure
        };

        RunReport {
            steps,
            outcome,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
