//! Target set resolution
//!
//! Per module, the resolved set is `(common ∪ additional[module]) − excluded[module]`
//! in insertion order: common targets first, then additional targets, with
//! duplicates dropped at their later occurrence. Exclusion always wins.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::catalog::{ModuleCatalog, ModuleRecord};
use crate::config::Config;

/// Common, excluded and additional target rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRules {
    /// Targets applied to every module, in configured order
    pub common: Vec<String>,
    /// Targets removed per module
    pub excluded: BTreeMap<String, Vec<String>>,
    /// Targets added per module, in configured order
    pub additional: BTreeMap<String, Vec<String>>,
}

/// Ordered, duplicate-free target list for one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResolvedTargetSet(Vec<String>);

impl ResolvedTargetSet {
    /// Build a set from names, dropping repeated names
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for name in names {
            let name = name.into();
            if seen.insert(name.clone()) {
                targets.push(name);
            }
        }
        Self(targets)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.0.iter().any(|t| t == target)
    }

    /// Intersect with a target filter; an empty filter keeps everything
    ///
    /// Names in the filter that this set lacks are ignored.
    pub fn filtered(&self, filter: &BTreeSet<String>) -> Self {
        if filter.is_empty() {
            return self.clone();
        }
        Self(self.0.iter().filter(|t| filter.contains(*t)).cloned().collect())
    }
}

impl<'a> IntoIterator for &'a ResolvedTargetSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl TargetRules {
    /// Extract the target rules from a configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            common: config.common_targets.clone(),
            excluded: config.excluded_targets.clone(),
            additional: config.additional_targets.clone(),
        }
    }

    /// Resolve the target set for a single module
    pub fn resolve_module(&self, module: &str) -> ResolvedTargetSet {
        let excluded: HashSet<&str> = self
            .excluded
            .get(module)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();

        let additional = self.additional.get(module).into_iter().flatten();

        ResolvedTargetSet::from_names(
            self.common
                .iter()
                .chain(additional)
                .filter(|t| !excluded.contains(t.as_str()))
                .cloned(),
        )
    }

    /// Resolve target sets for every module
    pub fn resolve(&self, modules: &[ModuleRecord]) -> BTreeMap<String, ResolvedTargetSet> {
        modules
            .iter()
            .map(|m| (m.name.clone(), self.resolve_module(&m.name)))
            .collect()
    }

    /// Describe rules that are legal but probably mistakes
    pub fn lint(&self, catalog: &ModuleCatalog) -> Vec<String> {
        let mut warnings = Vec::new();

        for (section, rules) in [("excluded_targets", &self.excluded), ("additional_targets", &self.additional)] {
            for module in rules.keys() {
                if !catalog.contains(module) {
                    warnings.push(format!(
                        "'{}' references module '{}' which was not found in module_paths",
                        section, module
                    ));
                }
            }
        }

        let common: HashSet<&str> = self.common.iter().map(String::as_str).collect();
        for (module, targets) in &self.additional {
            let duplicated: Vec<&str> = targets
                .iter()
                .map(String::as_str)
                .filter(|t| common.contains(t))
                .collect();
            if !duplicated.is_empty() {
                warnings.push(format!(
                    "Module '{}' has additional target(s) already present in common_targets: {:?}",
                    module, duplicated
                ));
            }
        }

        warnings
    }
}

/// Resolve target sets for `modules` from explicit rule parts
pub fn resolve_targets(
    modules: &[ModuleRecord],
    common: &[String],
    excluded: &BTreeMap<String, Vec<String>>,
    additional: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, ResolvedTargetSet> {
    TargetRules {
        common: common.to_vec(),
        excluded: excluded.clone(),
        additional: additional.clone(),
    }
    .resolve(modules)
}

/// Extract target names from `cmake --build <dir> --target help` output
///
/// Handles both the Makefile generator listing (`... all`) and the Ninja
/// listing (`all: phony`).
pub fn parse_help_output(output: &str) -> Vec<String> {
    ResolvedTargetSet::from_names(output.lines().filter_map(extract_target_name)).0
}

fn extract_target_name(line: &str) -> Option<String> {
    let mut text = line.trim();
    if text.is_empty() {
        return None;
    }

    let lowered = text.to_lowercase();
    if ["the following", "built with", "targets:", "all primary"]
        .iter()
        .any(|header| lowered.starts_with(header))
    {
        return None;
    }

    for bullet in ['*', '-', '+'] {
        if let Some(rest) = text.strip_prefix(bullet) {
            text = rest.trim_start();
        }
    }
    // Makefile listings prefix every entry with "... "
    if let Some(rest) = text.strip_prefix("...") {
        text = rest.trim_start();
    }

    for separator in [":", " ("] {
        if let Some((head, _)) = text.split_once(separator) {
            text = head.trim();
        }
    }

    let token = text.split_whitespace().next()?;
    is_target_token(token).then(|| token.to_string())
}

fn is_target_token(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '/' | '\\' | '-'))
}
