//! etm-core - Core library for etm
//!
//! This crate provides the core functionality for etm, including:
//! - Configuration file parsing and merging
//! - Module discovery under the configured module paths
//! - Per-module target resolution (common, excluded, additional)
//! - Build orchestration over CMake with make or ninja
//! - Step result aggregation into a run report

pub mod build;
pub mod catalog;
pub mod config;
pub mod error;
pub mod report;
pub mod targets;

pub use error::{Error, Result};
