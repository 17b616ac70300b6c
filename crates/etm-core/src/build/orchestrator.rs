//! Build orchestration
//!
//! This module drives the per-module pipeline:
//! - Applies module and target filters to produce a run plan
//! - Optionally removes the build directory, then configures each module
//! - Runs each resolved target in order, one module per worker
//! - Stops dispatching new work after a failure unless keep-going is set
//! - Feeds every step result into the aggregator

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::catalog::{ModuleCatalog, ModuleRecord};
use crate::config::BuildConfig;
use crate::report::{Aggregator, RunReport, Step, StepOutcome, StepResult};
use crate::targets::{ResolvedTargetSet, TargetRules, parse_help_output};
use crate::{Error, Result};

use super::backend::Backend;
use super::progress::RunProgress;
use super::runner::{Executor, LogCallback, ProcessRunner};

const REASON_ABORTED: &str = "run stopped after a failure";
const REASON_CONFIGURE_FAILED: &str = "configure step failed";
const REASON_UNAVAILABLE: &str = "target not provided by build system";
const REASON_ALREADY_CONFIGURED: &str = "build directory already configured";

/// Options for one invocation
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Remove the build directory and re-run the generator
    pub reconfigure: bool,
    /// Keep running remaining work after a failure
    pub keep_going: bool,
    /// Stream command output as it is produced
    pub verbose: bool,
    /// Only run these modules (empty = all)
    pub modules: BTreeSet<String>,
    /// Only run these targets (empty = all)
    pub targets: BTreeSet<String>,
}

/// Work for a single module
#[derive(Debug, Clone)]
pub struct ModulePlan {
    pub module: ModuleRecord,
    /// Resolved targets after the target filter
    pub targets: ResolvedTargetSet,
}

impl ModulePlan {
    /// Steps this module will report, configure first
    ///
    /// A module without targets contributes no work at all.
    pub fn steps(&self) -> Vec<Step> {
        if self.targets.is_empty() {
            return Vec::new();
        }
        std::iter::once(Step::Configure)
            .chain(self.targets.iter().map(|t| Step::Target(t.to_string())))
            .collect()
    }
}

/// Filtered, resolved work for a run
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Selected modules in catalog order
    pub modules: Vec<ModulePlan>,
    /// `--modules` names that are not in the catalog
    pub unknown_modules: Vec<String>,
    /// `--targets` names that no module resolves
    pub unknown_targets: Vec<String>,
}

impl RunPlan {
    /// Modules that have at least one target to run
    pub fn work(&self) -> impl Iterator<Item = &ModulePlan> {
        self.modules.iter().filter(|m| !m.targets.is_empty())
    }

    /// Total number of step results the run will produce
    pub fn total_steps(&self) -> usize {
        self.work().map(|m| m.targets.len() + 1).sum()
    }
}

#[derive(Debug)]
enum WorkerEvent {
    /// A step finished (or was skipped)
    Step(StepResult),
    /// The worker saw the halt flag before starting its module
    NotStarted { module: String },
    /// The worker is done with its module
    Finished { module: String, panicked: bool },
}

/// Runs planned modules on a bounded pool of workers
pub struct Orchestrator<E: Executor = ProcessRunner> {
    executor: Arc<E>,
    backend: Backend,
    concurrency: usize,
    progress: RunProgress,
}

impl Orchestrator<ProcessRunner> {
    /// Create an orchestrator that spawns real processes
    pub fn new(build: &BuildConfig) -> Self {
        Self::with_executor(Backend::from_config(build), ProcessRunner)
    }
}

impl<E: Executor> Orchestrator<E> {
    /// Create an orchestrator with a custom executor
    ///
    /// Concurrency defaults to the backend's job count.
    pub fn with_executor(backend: Backend, executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
            concurrency: backend.jobs.max(1),
            backend,
            progress: RunProgress::hidden(),
        }
    }

    /// Set the number of modules processed at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the progress display
    pub fn with_progress(mut self, progress: RunProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Apply filters and resolve targets for every selected module
    pub fn plan(&self, catalog: &ModuleCatalog, rules: &TargetRules, options: &RunOptions) -> RunPlan {
        for warning in rules.lint(catalog) {
            tracing::warn!("{}", warning);
        }

        let unknown_modules: Vec<String> = options
            .modules
            .iter()
            .filter(|name| !catalog.contains(name))
            .cloned()
            .collect();
        for name in &unknown_modules {
            tracing::warn!("Module '{}' was not found in module_paths", name);
        }

        let resolved = rules.resolve(catalog.modules());

        let known_targets: BTreeSet<&str> = resolved.values().flat_map(|set| set.iter()).collect();
        let unknown_targets: Vec<String> = options
            .targets
            .iter()
            .filter(|target| !known_targets.contains(target.as_str()))
            .cloned()
            .collect();
        for target in &unknown_targets {
            tracing::warn!("Target '{}' is not resolved for any module", target);
        }

        let modules = catalog
            .modules()
            .iter()
            .filter(|m| options.modules.is_empty() || options.modules.contains(&m.name))
            .map(|m| ModulePlan {
                module: m.clone(),
                targets: resolved
                    .get(&m.name)
                    .map(|set| set.filtered(&options.targets))
                    .unwrap_or_default(),
            })
            .collect();

        RunPlan {
            modules,
            unknown_modules,
            unknown_targets,
        }
    }

    /// Plan and execute in one call
    pub fn run(&self, catalog: &ModuleCatalog, rules: &TargetRules, options: &RunOptions) -> Result<RunReport> {
        let plan = self.plan(catalog, rules, options);
        self.execute(&plan, options)
    }

    /// Execute a plan on a dedicated runtime
    pub fn execute(&self, plan: &RunPlan, options: &RunOptions) -> Result<RunReport> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.concurrency)
            .enable_all()
            .build()
            .map_err(|e| {
                Error::runtime(
                    format!("Failed to create async runtime: {}", e),
                    "Check the process thread limits",
                )
            })?;

        Ok(rt.block_on(self.execute_async(plan, options)))
    }

    /// Execute a plan on the current runtime
    pub async fn execute_async(&self, plan: &RunPlan, options: &RunOptions) -> RunReport {
        let mut aggregator = Aggregator::new(options.keep_going);
        let mut queue: VecDeque<ModulePlan> = VecDeque::new();
        for module_plan in plan.work() {
            aggregator.plan_module(&module_plan.module.name, module_plan.steps());
            queue.push_back(module_plan.clone());
        }

        tracing::info!(
            "Running {} step(s) across {} module(s) with {} worker(s)",
            plan.total_steps(),
            queue.len(),
            self.concurrency
        );
        self.progress.start(plan.total_steps());

        let halt = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(self.concurrency * 4 + 1);
        let mut active_jobs = 0;

        loop {
            // Schedule new modules up to the limit
            while active_jobs < self.concurrency && !halt.load(Ordering::SeqCst) {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                active_jobs += 1;

                let worker = ModuleWorker {
                    executor: Arc::clone(&self.executor),
                    backend: self.backend.clone(),
                    progress: self.progress.clone(),
                    halt: Arc::clone(&halt),
                    options: options.clone(),
                    tx: tx.clone(),
                };
                let tx = tx.clone();
                let module = job.module.name.clone();

                tokio::spawn(async move {
                    let panicked = tokio::spawn(worker.run(job)).await.is_err();
                    let _ = tx.send(WorkerEvent::Finished { module, panicked }).await;
                });
            }

            if active_jobs == 0 {
                break;
            }

            // Wait for the next event
            let Some(event) = rx.recv().await else {
                break;
            };
            match event {
                WorkerEvent::Step(result) => {
                    self.progress.step_finished(&result);
                    aggregator.record(result);
                }
                WorkerEvent::NotStarted { module } => {
                    let filled = aggregator.record_unstarted(&module, REASON_ABORTED);
                    self.progress.steps_skipped(filled);
                }
                WorkerEvent::Finished { module, panicked } => {
                    active_jobs -= 1;
                    if panicked {
                        tracing::error!("Worker for {} panicked", module);
                        let filled = aggregator.fill_missing(&module, StepOutcome::Failed, "worker panicked");
                        self.progress.steps_skipped(filled);
                    }
                    self.progress.finish_module(&module);
                }
            }
        }

        for job in queue {
            tracing::info!("Not starting {} ({})", job.module.name, REASON_ABORTED);
            let filled = aggregator.record_unstarted(&job.module.name, REASON_ABORTED);
            self.progress.steps_skipped(filled);
        }
        tracing::debug!("{} of {} step(s) accounted for", self.progress.finished_steps(), plan.total_steps());

        let report = aggregator.finalize();
        self.progress.finish(&format!("{}", report.outcome));
        tracing::info!(
            "Run finished: {} ({} succeeded, {} failed, {} skipped)",
            report.outcome,
            report.count(StepOutcome::Succeeded),
            report.count(StepOutcome::Failed),
            report.count(StepOutcome::Skipped)
        );
        report
    }
}

/// Everything a module pipeline needs, owned so it can move into a task
struct ModuleWorker<E> {
    executor: Arc<E>,
    backend: Backend,
    progress: RunProgress,
    halt: Arc<AtomicBool>,
    options: RunOptions,
    tx: mpsc::Sender<WorkerEvent>,
}

impl<E: Executor> ModuleWorker<E> {
    async fn run(self, job: ModulePlan) {
        let module = &job.module;
        let name = module.name.as_str();

        if self.halted() {
            let _ = self
                .tx
                .send(WorkerEvent::NotStarted {
                    module: name.to_string(),
                })
                .await;
            return;
        }

        self.progress.start_module(name);
        tracing::info!("Module {} ({} target(s))", name, job.targets.len());

        let mut available = None;
        let mut configure = self.configure(module).await;
        if !configure.is_failed() && self.backend.probe_targets {
            match self.probe(module).await {
                Ok(targets) => available = Some(targets),
                Err(failed) => configure = failed,
            }
        }

        let configure_failed = configure.is_failed();
        if configure_failed {
            tracing::error!("[FAIL] {}: configure {}", name, describe_failure(&configure));
        }
        self.note(&configure);
        self.send(configure).await;

        for (index, target) in job.targets.iter().enumerate() {
            let position = index + 1;
            let step = Step::Target(target.to_string());

            if configure_failed {
                self.send(StepResult::skipped(name, step, position, REASON_CONFIGURE_FAILED))
                    .await;
                continue;
            }

            if self.halted() {
                self.send(StepResult::skipped(name, step, position, REASON_ABORTED))
                    .await;
                continue;
            }

            if available
                .as_ref()
                .is_some_and(|targets: &Vec<String>| !targets.iter().any(|t| t.as_str() == target))
            {
                tracing::warn!("Skipping {}:{} ({})", name, target, REASON_UNAVAILABLE);
                self.send(StepResult::skipped(name, step, position, REASON_UNAVAILABLE))
                    .await;
                continue;
            }

            self.progress.update_module(name, target);
            let invocation = self.backend.target(&module.path, target);
            let result = self
                .executor
                .execute(&invocation, Some(self.log_callback(name)))
                .await
                .into_step_result(name, step, position);

            if result.is_failed() {
                tracing::error!("[FAIL] {}: target '{}' {}", name, target, describe_failure(&result));
            } else {
                tracing::debug!("{}: target '{}' finished in {:?}", name, target, result.duration);
            }
            self.note(&result);
            self.send(result).await;
        }
    }

    /// Remove the build directory if requested, then run the generator
    async fn configure(&self, module: &ModuleRecord) -> StepResult {
        let name = module.name.as_str();
        let build_dir = self.backend.build_dir(&module.path);

        if self.options.reconfigure {
            if build_dir.exists() {
                tracing::info!("[reconfigure] Removing {}", build_dir);
                if let Err(e) = tokio::fs::remove_dir_all(&build_dir).await {
                    return StepResult::failed(
                        name,
                        Step::Configure,
                        0,
                        Error::environment(
                            format!("failed to remove {}: {}", build_dir, e),
                            "Check the permissions of the build directory",
                        )
                        .to_string(),
                    );
                }
            }
        } else if build_dir.is_dir() {
            tracing::debug!("{} already has {}, not re-running CMake", name, build_dir);
            return StepResult::reused(name, Step::Configure, 0, REASON_ALREADY_CONFIGURED);
        }

        self.progress.update_module(name, "configuring");
        tracing::debug!("Running CMake for module {}", name);
        let invocation = self.backend.configure(&module.path);
        self.executor
            .execute(&invocation, Some(self.log_callback(name)))
            .await
            .into_step_result(name, Step::Configure, 0)
    }

    /// Ask the build system which targets it provides
    ///
    /// A failed probe is reported as a failed configure step.
    async fn probe(&self, module: &ModuleRecord) -> std::result::Result<Vec<String>, StepResult> {
        let invocation = self.backend.probe(&module.path);
        let execution = self.executor.execute(&invocation, None).await;

        if execution.success() {
            let targets = parse_help_output(&execution.output);
            tracing::debug!("{} provides {} target(s)", module.name, targets.len());
            return Ok(targets);
        }

        let mut result = execution.into_step_result(&module.name, Step::Configure, 0);
        let error = Error::environment(
            format!("target discovery failed: {}", describe_failure(&result)),
            "Check that the generated build directory is valid",
        );
        result.reason = Some(error.to_string());
        Err(result)
    }

    fn log_callback(&self, module: &str) -> LogCallback {
        let module = module.to_string();
        let progress = self.progress.clone();
        let verbose = self.options.verbose;

        Arc::new(move |line: &str| {
            if verbose {
                tracing::info!(target: "build_output", module = %module, "{}", line);
            } else {
                tracing::debug!(target: "build_output", module = %module, "{}", line);
                progress.update_module(&module, line);
            }
        })
    }

    fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Stop dispatching new work after a failure unless keep-going is set
    fn note(&self, result: &StepResult) {
        if result.is_failed() && !self.options.keep_going {
            self.halt.store(true, Ordering::SeqCst);
        }
    }

    async fn send(&self, result: StepResult) {
        if self.tx.send(WorkerEvent::Step(result)).await.is_err() {
            tracing::warn!("Result channel closed before a step could be reported");
        }
    }
}

fn describe_failure(result: &StepResult) -> String {
    match (&result.reason, result.exit_code) {
        (Some(reason), _) => reason.clone(),
        (None, Some(code)) => format!("exited with code {}", code),
        (None, None) => "failed".to_string(),
    }
}
