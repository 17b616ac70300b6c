//! Module discovery
//!
//! A module is an immediate subdirectory of a configured module path that
//! carries a `CMakeLists.txt` at its root. Directories without one are not
//! modules and are skipped silently.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use std::collections::HashMap;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Build descriptor that marks a directory as a module
pub const BUILD_DESCRIPTOR: &str = "CMakeLists.txt";

/// A discovered module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    /// Directory name, unique within a run
    pub name: String,

    /// Path to the module directory
    pub path: Utf8PathBuf,

    /// Whether the build descriptor exists at the module root
    pub has_build_descriptor: bool,
}

/// Source of candidate module directories
pub trait ModuleProvider {
    /// List the immediate subdirectories of `root`, sorted by name
    ///
    /// A `root` the provider cannot list is a configuration error.
    fn candidates(&self, root: &Utf8Path) -> Result<Vec<ModuleRecord>>;
}

/// Filesystem-backed provider
#[derive(Debug, Clone, Copy, Default)]
pub struct FsModuleProvider;

impl ModuleProvider for FsModuleProvider {
    fn candidates(&self, root: &Utf8Path) -> Result<Vec<ModuleRecord>> {
        if !root.is_dir() {
            return Err(Error::config(
                format!("Module path does not exist or is not a directory: {}", root),
                "Fix the entry in module_paths",
            ));
        }

        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        let mut records = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Broken symlinks and unreadable children are not modules
                Err(e) if e.depth() > 0 => {
                    tracing::debug!("Skipping entry in {}: {}", root, e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::config(
                        format!("Failed to read module path {}: {}", root, e),
                        "Check directory permissions",
                    ));
                }
            };

            if !entry.file_type().is_dir() {
                continue;
            }

            let path = Utf8Path::from_path(entry.path()).ok_or_else(|| {
                Error::config(
                    format!("Path is not valid UTF-8: {:?}", entry.path()),
                    "Ensure all module paths are valid UTF-8",
                )
            })?;
            let Some(name) = path.file_name() else {
                continue;
            };

            records.push(ModuleRecord {
                name: name.to_string(),
                path: path.to_path_buf(),
                has_build_descriptor: path.join(BUILD_DESCRIPTOR).is_file(),
            });
        }

        Ok(records)
    }
}

/// Modules discovered from all configured module paths
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: Vec<ModuleRecord>,
}

impl ModuleCatalog {
    /// Discover modules on the filesystem
    pub fn discover(module_paths: &[Utf8PathBuf]) -> Result<Self> {
        Self::resolve(module_paths, &FsModuleProvider)
    }

    /// Resolve module paths into module records using `provider`
    ///
    /// Modules keep the order of `module_paths`, then directory name order.
    pub fn resolve(module_paths: &[Utf8PathBuf], provider: &dyn ModuleProvider) -> Result<Self> {
        let mut modules: Vec<ModuleRecord> = Vec::new();
        let mut seen: HashMap<String, Utf8PathBuf> = HashMap::new();

        for root in module_paths {
            for record in provider.candidates(root)? {
                if !record.has_build_descriptor {
                    tracing::debug!(path = %record.path, "Skipping directory without {}", BUILD_DESCRIPTOR);
                    continue;
                }

                if let Some(existing) = seen.get(&record.name) {
                    return Err(Error::duplicate_module(
                        record.name,
                        existing.clone(),
                        record.path,
                    ));
                }

                tracing::debug!(name = %record.name, path = %record.path, "Discovered module");
                seen.insert(record.name.clone(), record.path.clone());
                modules.push(record);
            }
        }

        if modules.is_empty() {
            tracing::warn!("No modules found; module paths contain no subfolders with {}", BUILD_DESCRIPTOR);
        } else {
            tracing::info!("Discovered {} module(s)", modules.len());
        }

        Ok(Self { modules })
    }

    /// Modules in discovery order
    pub fn modules(&self) -> &[ModuleRecord] {
        &self.modules
    }

    /// Get a module by name
    pub fn get(&self, name: &str) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Check whether a module with this name was discovered
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
