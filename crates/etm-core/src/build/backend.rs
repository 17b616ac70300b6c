//! Command lines for the CMake generator and the make/ninja backends

use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;

use crate::config::{BuildConfig, BuildSystem};

use super::runner::Invocation;

/// Backend settings shared by every module in a run
#[derive(Debug, Clone)]
pub struct Backend {
    /// make or ninja
    pub system: BuildSystem,
    /// Parallelism passed to the backend (`-j`)
    pub jobs: usize,
    /// Module-relative build directory
    pub out_dir: Utf8PathBuf,
    /// Per-step timeout
    pub timeout: Option<Duration>,
    /// Query available targets after configuring
    pub probe_targets: bool,
}

impl Backend {
    /// Backend settings from the `build` section of the configuration
    pub fn from_config(build: &BuildConfig) -> Self {
        Self {
            system: build.system,
            jobs: build.effective_jobs(),
            out_dir: build.out_dir.clone(),
            timeout: build.step_timeout(),
            probe_targets: build.probe_targets,
        }
    }

    /// Build directory of a module
    pub fn build_dir(&self, module_path: &Utf8Path) -> Utf8PathBuf {
        module_path.join(&self.out_dir)
    }

    /// `cmake -S . -B out -G <generator>`, run from the module directory
    pub fn configure(&self, module_path: &Utf8Path) -> Invocation {
        Invocation::new(
            "cmake",
            [
                "-S",
                ".",
                "-B",
                self.out_dir.as_str(),
                "-G",
                self.system.generator(),
            ],
            module_path,
        )
        .with_timeout(self.timeout)
    }

    /// `make -jN <target>` or `ninja -jN <target>`, run from the build directory
    pub fn target(&self, module_path: &Utf8Path, target: &str) -> Invocation {
        Invocation::new(
            self.system.program(),
            [format!("-j{}", self.jobs), target.to_string()],
            self.build_dir(module_path),
        )
        .with_timeout(self.timeout)
    }

    /// `cmake --build out --target help`, run from the module directory
    pub fn probe(&self, module_path: &Utf8Path) -> Invocation {
        Invocation::new(
            "cmake",
            ["--build", self.out_dir.as_str(), "--target", "help"],
            module_path,
        )
        .with_timeout(self.timeout)
    }
}
