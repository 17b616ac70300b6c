//! Configuration file parsing and merging
//!
//! This module handles parsing of the YAML run configuration (`config.yaml` by
//! default) and an optional `config.local.yaml` overlay next to it.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{Error, Result};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Main configuration structure for etm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Build backend settings
    pub build: BuildConfig,

    /// Directories whose immediate subdirectories are modules
    pub module_paths: Vec<Utf8PathBuf>,

    /// Targets run for every module
    #[serde(default)]
    pub common_targets: Vec<String>,

    /// Per-module targets removed from the common set
    #[serde(default, deserialize_with = "nullable_map")]
    pub excluded_targets: BTreeMap<String, Vec<String>>,

    /// Per-module targets added after the common set
    #[serde(default, deserialize_with = "nullable_map")]
    pub additional_targets: BTreeMap<String, Vec<String>>,
}

/// Build backend used to generate and drive module builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    Make,
    Ninja,
}

impl BuildSystem {
    /// CMake generator name for this backend
    pub fn generator(&self) -> &'static str {
        match self {
            BuildSystem::Make => "Unix Makefiles",
            BuildSystem::Ninja => "Ninja",
        }
    }

    /// Executable that runs a single target
    pub fn program(&self) -> &'static str {
        match self {
            BuildSystem::Make => "make",
            BuildSystem::Ninja => "ninja",
        }
    }
}

impl std::fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Backend (make | ninja)
    pub system: BuildSystem,

    /// Parallel jobs (default: number of logical CPUs)
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Module-relative build directory (default: "out")
    #[serde(default = "default_out_dir")]
    pub out_dir: Utf8PathBuf,

    /// Per-step timeout in seconds (default: none)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Ask the build system which targets exist before running them
    #[serde(default)]
    pub probe_targets: bool,
}

fn default_out_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("out")
}

/// `excluded_targets:` with no entries parses as null in YAML
fn nullable_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, Vec<String>>>::deserialize(deserializer)?.unwrap_or_default())
}

impl BuildConfig {
    /// Per-step timeout, if configured
    pub fn step_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Get the effective number of jobs
    pub fn effective_jobs(&self) -> usize {
        self.jobs
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// This loads the given file and merges `<stem>.local.<ext>` over it if
    /// that file exists. Relative module paths are resolved against the
    /// directory containing `path`.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                format!("Failed to read '{}': {}", path, e),
                "Pass an existing configuration file with --config",
            )
        })?;
        let base: serde_yaml::Value = serde_yaml::from_str(&content)?;

        let local_path = local_overlay_path(path);
        let merged = match local_path {
            Some(local_path) if local_path.exists() => {
                tracing::debug!("Merging local overlay {}", local_path);
                let local_content = std::fs::read_to_string(&local_path)?;
                let local: serde_yaml::Value = serde_yaml::from_str(&local_content)?;
                merge_yaml_values(base, local)
            }
            _ => base,
        };

        let mut config = Self::from_value(merged)?;

        let base_dir = absolute_parent(path)?;
        config.module_paths = config
            .module_paths
            .iter()
            .map(|p| resolve_module_path(p, &base_dir))
            .collect();

        Ok(config)
    }

    /// Load configuration from a string (for testing)
    ///
    /// Module paths are left exactly as written.
    pub fn parse(content: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        Self::from_value(value)
    }

    fn from_value(value: serde_yaml::Value) -> Result<Self> {
        if !value.is_mapping() {
            return Err(Error::config(
                "YAML root must be a mapping",
                "Start the file with the `build:` section",
            ));
        }
        let mut config: Config = serde_yaml::from_value(value)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        let trim = |targets: &mut Vec<String>| {
            for target in targets.iter_mut() {
                *target = target.trim().to_string();
            }
        };

        trim(&mut self.common_targets);
        self.excluded_targets.values_mut().for_each(trim);
        self.additional_targets.values_mut().for_each(trim);
    }

    /// Check the constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.build.jobs == Some(0) {
            return Err(Error::config(
                "build.jobs must be at least 1",
                "Remove build.jobs to use the number of logical CPUs",
            ));
        }

        if self.build.timeout_secs == Some(0) {
            return Err(Error::config(
                "build.timeout_secs must be at least 1",
                "Remove build.timeout_secs to disable step timeouts",
            ));
        }

        if self.module_paths.is_empty() {
            return Err(Error::config(
                "module_paths must list at least one directory",
                "Add the directories that contain your modules",
            ));
        }

        if self.module_paths.iter().any(|p| p.as_str().trim().is_empty()) {
            return Err(Error::config(
                "All entries in 'module_paths' must be non-empty",
                "Remove blank entries from module_paths",
            ));
        }

        if self.common_targets.iter().any(|t| t.is_empty()) {
            return Err(Error::config(
                "All entries in 'common_targets' must be non-empty",
                "Remove blank entries from common_targets",
            ));
        }

        for (section, rules) in [
            ("excluded_targets", &self.excluded_targets),
            ("additional_targets", &self.additional_targets),
        ] {
            for (module, targets) in rules {
                if module.trim().is_empty() {
                    return Err(Error::config(
                        format!("Keys in '{}' must be non-empty module names", section),
                        format!("Use `{}: {{ MODULE: [targets...] }}`", section),
                    ));
                }
                if targets.iter().any(|t| t.is_empty()) {
                    return Err(Error::config(
                        format!("'{}.{}' must be a list of non-empty strings", section, module),
                        "Remove blank target names",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// `config.yaml` -> `config.local.yaml`
fn local_overlay_path(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let stem = path.file_stem()?;
    let name = match path.extension() {
        Some(ext) => format!("{}.local.{}", stem, ext),
        None => format!("{}.local", stem),
    };
    Some(path.with_file_name(name))
}

fn absolute_parent(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let parent = path.parent().unwrap_or(Utf8Path::new(""));
    if parent.is_absolute() {
        return Ok(parent.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    let cwd = Utf8PathBuf::try_from(cwd).map_err(|e| {
        Error::config(
            format!("Current directory is not valid UTF-8: {}", e),
            "Run etm from a directory with a UTF-8 path",
        )
    })?;
    if parent.as_str().is_empty() {
        Ok(cwd)
    } else {
        Ok(cwd.join(parent))
    }
}

/// Expand `~` and anchor relative paths at the config file's directory
fn resolve_module_path(path: &Utf8Path, base_dir: &Utf8Path) -> Utf8PathBuf {
    let expanded = match path.as_str().strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var("HOME") {
            Ok(home) => Utf8PathBuf::from(format!("{}{}", home, rest)),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Merge two YAML values:
/// - Mappings: recursively merged
/// - Sequences: local replaces base (not merged)
/// - Scalars: local overrides base
fn merge_yaml_values(base: serde_yaml::Value, local: serde_yaml::Value) -> serde_yaml::Value {
    match (base, local) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(local_map)) => {
            for (key, local_value) in local_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_yaml_values(base_value, local_value),
                    None => local_value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, local) => local,
    }
}
