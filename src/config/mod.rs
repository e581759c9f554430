// src/config/mod.rs

//! Configuration loading and validation for taskhost.
//!
//! - `model.rs`: the TOML-backed data model.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: `RawConfigFile` -> `ConfigFile` checks.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, workspace_root_of};
pub use model::{ConfigFile, ConfigSection, ProjectConfig, RawConfigFile, UnitConfig};
