//! Integration tests for configuration loading, discovery and orchestration

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use etm_core::build::{Backend, Execution, Executor, Invocation, LogCallback, Orchestrator, RunOptions};
use etm_core::catalog::ModuleCatalog;
use etm_core::config::{BuildSystem, Config};
use etm_core::report::{RunOutcome, StepOutcome};
use etm_core::targets::TargetRules;

fn fixtures_path() -> Utf8PathBuf {
    let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../tests/fixtures")
        .canonicalize()
        .expect("fixtures directory should exist");
    Utf8PathBuf::from_path_buf(path).expect("path should be valid UTF-8")
}

fn sample_config() -> Config {
    Config::load(&fixtures_path().join("sample_project/config.yaml")).expect("config should load")
}

/// Records invocations and fails the ones whose last argument is listed
struct RecordingExecutor {
    failing: Vec<&'static str>,
    calls: Mutex<Vec<Invocation>>,
}

impl RecordingExecutor {
    fn new(failing: Vec<&'static str>) -> Self {
        Self {
            failing,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl Executor for RecordingExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        log_callback: Option<LogCallback>,
    ) -> impl Future<Output = Execution> + Send {
        self.calls.lock().unwrap().push(invocation.clone());
        let last = invocation.args.last().cloned().unwrap_or_default();
        let code = if self.failing.contains(&last.as_str()) { 2 } else { 0 };
        if let Some(callback) = log_callback {
            callback(&format!("running {}", invocation));
        }
        async move { Execution::exited(code, format!("{}\n", last), Duration::from_millis(2)) }
    }
}

fn orchestrator(config: &Config, failing: Vec<&'static str>, concurrency: usize) -> Orchestrator<RecordingExecutor> {
    Orchestrator::with_executor(Backend::from_config(&config.build), RecordingExecutor::new(failing))
        .with_concurrency(concurrency)
}

#[test]
fn test_load_sample_config() {
    let config = sample_config();

    assert_eq!(config.build.system, BuildSystem::Make);
    assert_eq!(config.build.effective_jobs(), 2);
    assert_eq!(
        config.module_paths,
        vec![fixtures_path().join("sample_project/modules")]
    );
    assert!(config.module_paths[0].is_absolute());
}

#[test]
fn test_discover_sample_modules() {
    let config = sample_config();

    let catalog = ModuleCatalog::discover(&config.module_paths).expect("discovery should succeed");

    let names: Vec<&str> = catalog.modules().iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["bootloader", "sensor_driver"]);
    assert!(!catalog.contains("docs"));
    assert!(catalog.get("bootloader").unwrap().path.ends_with("modules/bootloader"));
}

#[test]
fn test_resolve_sample_targets() {
    let config = sample_config();
    let catalog = ModuleCatalog::discover(&config.module_paths).unwrap();
    let rules = TargetRules::from_config(&config);

    let resolved = rules.resolve(catalog.modules());

    assert_eq!(resolved["bootloader"].as_slice(), ["all", "ccmr", "flash"]);
    assert_eq!(resolved["sensor_driver"].as_slice(), ["all", "unit_tests"]);
    assert!(rules.lint(&catalog).is_empty());
}

#[test]
fn test_run_sample_project() {
    let config = sample_config();
    let catalog = ModuleCatalog::discover(&config.module_paths).unwrap();
    let rules = TargetRules::from_config(&config);
    let orchestrator = orchestrator(&config, Vec::new(), 2);

    let report = orchestrator
        .run(&catalog, &rules, &RunOptions::default())
        .expect("run should start");

    assert_eq!(report.outcome, RunOutcome::AllSucceeded);
    assert_eq!(report.steps.len(), 7);
    assert!(report.steps.iter().all(|s| s.started_at.is_some()));

    let calls = orchestrator.executor().calls.lock().unwrap().clone();
    let configure = calls
        .iter()
        .find(|c| c.cwd.ends_with("bootloader") && c.program == "cmake")
        .expect("bootloader should be configured");
    assert_eq!(configure.args, vec!["-S", ".", "-B", "out", "-G", "Unix Makefiles"]);

    let flash = calls
        .iter()
        .find(|c| c.args.last().map(String::as_str) == Some("flash"))
        .expect("flash should run");
    assert_eq!(flash.program, "make");
    assert_eq!(flash.args, vec!["-j2", "flash"]);
    assert!(flash.cwd.ends_with(Utf8Path::new("bootloader/out")));
}

#[test]
fn test_keep_going_sample_project() {
    let config = sample_config();
    let catalog = ModuleCatalog::discover(&config.module_paths).unwrap();
    let rules = TargetRules::from_config(&config);
    let orchestrator = orchestrator(&config, vec!["all"], 2);
    let options = RunOptions {
        keep_going: true,
        ..Default::default()
    };

    let report = orchestrator.run(&catalog, &rules, &options).unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    assert_eq!(report.count(StepOutcome::Failed), 2);
    assert_eq!(report.count(StepOutcome::Succeeded), 5);
    assert_eq!(report.outcome.exit_code(), 1);
}

#[test]
fn test_filters_on_sample_project() {
    let config = sample_config();
    let catalog = ModuleCatalog::discover(&config.module_paths).unwrap();
    let rules = TargetRules::from_config(&config);
    let orchestrator = orchestrator(&config, Vec::new(), 1);
    let options = RunOptions {
        modules: BTreeSet::from(["sensor_driver".to_string()]),
        targets: BTreeSet::from(["unit_tests".to_string(), "flash".to_string()]),
        ..Default::default()
    };

    let plan = orchestrator.plan(&catalog, &rules, &options);
    let report = orchestrator.execute(&plan, &options).unwrap();

    // flash resolves for bootloader, which the module filter removed
    assert!(plan.unknown_targets.is_empty());
    let steps: Vec<String> = report.steps.iter().map(|s| format!("{}:{}", s.module, s.step)).collect();
    assert_eq!(steps, vec!["sensor_driver:<configure>", "sensor_driver:unit_tests"]);
}

#[test]
fn test_report_serializes_to_json() {
    let config = sample_config();
    let catalog = ModuleCatalog::discover(&config.module_paths).unwrap();
    let rules = TargetRules::from_config(&config);
    let orchestrator = orchestrator(&config, vec!["flash"], 1);

    let report = orchestrator.run(&catalog, &rules, &RunOptions::default()).unwrap();
    let value = serde_json::to_value(&report).unwrap();

    assert_eq!(value["outcome"], "aborted");
    assert_eq!(value["steps"][0]["step"]["kind"], "configure");
    assert_eq!(value["steps"][3]["step"]["name"], "flash");
    assert_eq!(value["steps"][3]["outcome"], "failed");
    assert!(value["finished_at"].is_string());
}
