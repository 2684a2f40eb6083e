//! Configuration for the `bindbox` binary
//!
//! The library is configured programmatically through `BindOptions`; this
//! module only serves the CLI, loading settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Environment variables
//!
//! Settings can be overridden with the pattern `BINDBOX__<section>__<key>`:
//!
//! - `BINDBOX__FETCH__MAX_REDIRECTS=3`
//! - `BINDBOX__HTTP__REQUEST_TIMEOUT_SECS=120`
//! - `BINDBOX__HTTP__MAX_BODY=100MB`
//!
//! The configuration file defaults to `config/bindbox.toml` and can be
//! pointed elsewhere with `BINDBOX_CONFIG`.

mod models;
mod sources;

pub use models::{ByteSize, Config, FetchConfig, HttpSection, LogConfig};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

impl Config {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        Ok(sources::load()?)
    }

    /// Load configuration from a specific path, plus environment overrides.
    /// Useful for tests with custom config files.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        Ok(sources::load_from_sources(path)?)
    }
}
