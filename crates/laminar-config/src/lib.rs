//! Configuration parsing for the Laminar scheduling core.
//!
//! This crate handles:
//! - `KEY=value` conf files (`ConfMap`)
//! - The `cfg/` directory layout: contexts, jobs, groups

pub mod error;
pub mod file;
pub mod loader;

pub use error::{ConfigError, ConfigResult};
pub use file::ConfMap;
pub use loader::{check_legacy, load, ContextConfig, ContextFile, JobConfig, JobFile, LoadedConfig};
