//! Error types for etm
//!
//! Only errors raised before any process is spawned surface as `Error`.
//! Failures inside a module's pipeline are captured as failed steps in the
//! run report instead.

// This warning is a false positive from thiserror macro expansion
#![allow(unused_assignments)]

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for etm operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for etm
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse YAML: {0}")]
    #[diagnostic(help("Check the configuration file syntax and field types"))]
    YamlParse(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[help]
        help: String,
    },

    /// The same module name was discovered under two module paths
    #[error("Duplicate module name '{name}' (found at {first} and {second})")]
    #[diagnostic(help("Module names must be unique across all module_paths"))]
    DuplicateModule {
        name: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },

    /// Environment error (filesystem or external tool problem)
    #[error("Environment error: {message}")]
    Environment {
        message: String,
        #[help]
        help: String,
    },

    /// The async runtime driving the workers could not be created
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        #[help]
        help: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create an environment error
    pub fn environment(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a duplicate module error
    pub fn duplicate_module(
        name: impl Into<String>,
        first: impl Into<Utf8PathBuf>,
        second: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self::DuplicateModule {
            name: name.into(),
            first: first.into(),
            second: second.into(),
        }
    }
}
