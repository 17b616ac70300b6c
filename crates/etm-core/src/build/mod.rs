//! Build execution for CMake modules
//!
//! This module provides the build functionality for etm, including:
//! - Command lines for the CMake generator and make/ninja backends
//! - Process execution with output capture and timeouts
//! - Parallel module orchestration with fail-fast or keep-going policy
//! - Progress display

mod backend;
mod orchestrator;
mod progress;
mod runner;

pub use backend::Backend;
pub use orchestrator::{ModulePlan, Orchestrator, RunOptions, RunPlan};
pub use progress::RunProgress;
pub use runner::{Execution, Executor, Invocation, LogCallback, ProcessRunner, run_command_with_logging};
