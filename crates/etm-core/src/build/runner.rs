//! Command execution with output capture
//!
//! This module runs external commands (CMake configure, make/ninja targets)
//! while capturing their combined output. Each output line is:
//! 1. Appended to the captured output of the step
//! 2. Passed to the log callback for streaming and progress display

use camino::Utf8PathBuf;
use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::report::{Step, StepOutcome, StepResult};

/// Callback for log lines
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Utf8PathBuf,
    /// Kill the process after this long
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I, cwd: impl Into<Utf8PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// What happened when a command ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Exit code, `None` if the process did not exit on its own
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
    /// Wall-clock duration
    pub duration: Duration,
    /// Why the command failed other than by a non-zero exit
    pub error: Option<String>,
}

impl Execution {
    /// A command that exited with `code`
    pub fn exited(code: i32, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: Some(code),
            output: output.into(),
            duration,
            error: None,
        }
    }

    /// A command that could not run to completion
    pub fn errored(error: impl Into<String>, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: None,
            output: output.into(),
            duration,
            error: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// Turn the execution into the result of `step`
    pub fn into_step_result(self, module: &str, step: Step, position: usize) -> StepResult {
        let started_at = chrono::Utc::now()
            - chrono::Duration::from_std(self.duration).unwrap_or_else(|_| chrono::Duration::zero());
        let outcome = if self.success() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed
        };

        StepResult {
            module: module.to_string(),
            step,
            position,
            outcome,
            exit_code: self.exit_code,
            duration: self.duration,
            output: self.output,
            reason: self.error,
            started_at: Some(started_at),
        }
    }
}

/// Capability to run an external command
///
/// The orchestrator only touches processes through this trait, so tests can
/// substitute a scripted implementation.
pub trait Executor: Send + Sync + 'static {
    /// Run `invocation`, streaming output lines to `log_callback`
    fn execute(
        &self,
        invocation: &Invocation,
        log_callback: Option<LogCallback>,
    ) -> impl Future<Output = Execution> + Send;
}

/// Runs commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl Executor for ProcessRunner {
    async fn execute(&self, invocation: &Invocation, log_callback: Option<LogCallback>) -> Execution {
        run_command_with_logging(invocation, log_callback).await
    }
}

/// Run a command with log capture
///
/// Spawn failures (for example a missing `ninja`) and timeouts are reported
/// through [`Execution::error`] rather than as `Err`.
pub async fn run_command_with_logging(
    invocation: &Invocation,
    log_callback: Option<LogCallback>,
) -> Execution {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // A timed out step must take its compiler processes down with it
    #[cfg(unix)]
    if invocation.timeout.is_some() {
        command.process_group(0);
    }

    tracing::debug!("Running command: {} (in {})", invocation, invocation.cwd);

    let start = Instant::now();

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Execution::errored(
                format!("failed to start '{}': {}", invocation.program, e),
                String::new(),
                start.elapsed(),
            );
        }
    };

    let captured = Arc::new(Mutex::new(String::new()));

    let stdout_handle = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(forward_lines(stdout, captured.clone(), log_callback.clone())));
    let stderr_handle = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward_lines(stderr, captured.clone(), log_callback)));

    let waited = match invocation.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Ok(status),
            Err(_) => Err(limit),
        },
        None => Ok(child.wait().await),
    };

    let mut error = None;
    let exit_code = match waited {
        Ok(Ok(status)) => {
            // Wait for output tasks to finish
            for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
                let _ = handle.await;
            }
            if status.code().is_none() {
                error = Some("terminated by signal".to_string());
            }
            status.code()
        }
        Ok(Err(e)) => {
            error = Some(format!("failed to wait for '{}': {}", invocation.program, e));
            None
        }
        Err(limit) => {
            kill_process_group(&child);
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill timed out process {}: {}", invocation, e);
            }
            // Grandchildren may still hold the pipes open
            for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
                handle.abort();
            }
            error = Some(format!("timed out after {}s", limit.as_secs_f64()));
            None
        }
    };

    let duration = start.elapsed();
    let output = captured
        .lock()
        .map(|output| output.clone())
        .unwrap_or_default();

    match error {
        Some(error) => Execution::errored(error, output, duration),
        None => Execution::exited(exit_code.unwrap_or(-1), output, duration),
    }
}

/// Signal every process in the child's group
///
/// The child leads its own group only when the invocation has a timeout.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    if unsafe { libc::kill(-pid, libc::SIGKILL) } != 0 {
        tracing::debug!(
            "Failed to signal process group {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Read `reader` to EOF, one line at a time
///
/// Lines are decoded lossily so that stray non-UTF-8 bytes never stop the
/// pipe from being drained.
async fn forward_lines<R>(reader: R, captured: Arc<Mutex<String>>, log_callback: Option<LogCallback>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Stopped reading command output: {}", e);
                break;
            }
        }

        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(['\n', '\r']);
        if let Ok(mut output) = captured.lock() {
            output.push_str(line);
            output.push('\n');
        }

        if let Some(ref callback) = log_callback {
            callback(line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh", ["-c", script], std::env::temp_dir().to_str().unwrap())
    }

    #[tokio::test]
    async fn test_captures_combined_output() {
        let execution = ProcessRunner
            .execute(&sh("echo out; echo err 1>&2"), None)
            .await;

        assert!(execution.success());
        assert_eq!(execution.exit_code, Some(0));
        assert!(execution.output.contains("out\n"));
        assert!(execution.output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let execution = ProcessRunner.execute(&sh("exit 3"), None).await;

        assert!(!execution.success());
        assert_eq!(execution.exit_code, Some(3));
        assert!(execution.error.is_none());

        let result = execution.into_step_result("app", Step::Target("all".into()), 1);
        assert_eq!(result.outcome, StepOutcome::Failed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("marker.txt"), "").unwrap();
        let invocation = Invocation::new("ls", Vec::<String>::new(), temp_dir.path().to_str().unwrap());

        let execution = ProcessRunner.execute(&invocation, None).await;

        assert!(execution.output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let invocation = Invocation::new("etm-no-such-tool", ["all"], "/");

        let execution = ProcessRunner.execute(&invocation, None).await;

        assert!(!execution.success());
        assert_eq!(execution.exit_code, None);
        assert!(execution.error.unwrap().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let invocation = sh("echo started; sleep 10").with_timeout(Some(Duration::from_millis(300)));

        let execution = ProcessRunner.execute(&invocation, None).await;

        assert!(!execution.success());
        assert_eq!(execution.exit_code, None);
        assert!(execution.error.unwrap().starts_with("timed out"));
        assert!(execution.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_drained() {
        let script = "printf 'caf\\351\\n'; i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; echo DONE";

        let execution = ProcessRunner.execute(&sh(script), None).await;

        assert!(execution.success(), "error: {:?}", execution.error);
        assert_eq!(execution.exit_code, Some(0));
        assert!(execution.output.starts_with("caf\u{FFFD}\n"));
        assert!(execution.output.contains("line 19999\n"));
        assert!(execution.output.ends_with("DONE\n"));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_processes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let marker = temp_dir.path().join("late.txt");
        let script = format!("(sleep 1; touch '{}') & echo started; sleep 10", marker.display());
        let invocation = sh(&script).with_timeout(Some(Duration::from_millis(300)));

        let execution = ProcessRunner.execute(&invocation, None).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(execution.error.unwrap().starts_with("timed out"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_log_callback_receives_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });

        ProcessRunner.execute(&sh("echo one; echo two"), Some(callback)).await;

        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }
}
