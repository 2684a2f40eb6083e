use std::env;
use std::path::PathBuf;

use config::{ConfigError, Environment, File};

use super::models::Config;

const CONFIG_ENV_VAR: &str = "BINDBOX_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/bindbox.toml";
const ENV_PREFIX: &str = "BINDBOX";
const ENV_SEPARATOR: &str = "__";

/// Load configuration with priority: defaults < TOML file < `.env` file
/// (via dotenvy) < process environment.
pub fn load() -> Result<Config, ConfigError> {
    // Load .env if present; a missing file is not an error.
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    load_from_sources(config_path)
}

pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::debug!(path = %config_path.display(), "loading configuration file");
        builder = builder.add_source(File::from(config_path).required(false));
    }

    // BINDBOX__HTTP__USER_AGENT -> http.user_agent
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
