// src/config/mod.rs

//! Configuration loading and validation for spotrun.
//!
//! - `model.rs`: the TOML-backed data model and its defaults.
//! - `loader.rs`: locating and reading the file.
//! - `validate.rs`: `RawConfigFile` -> `ConfigFile` checks.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_or_default, resolve_config_path};
pub use model::{ConfigFile, DefaultsSection, RawConfigFile, CANDIDATE_REGIONS};
