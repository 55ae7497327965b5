//! Stack file loading.
//!
//! This module handles loading the stack file from YAML and applying
//! environment variable overrides on top of it.

use crate::error::{CirrusError, ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment variable overriding `project.name`.
pub const ENV_PROJECT_NAME: &str = "CIRRUS_PROJECT_NAME";
/// Environment variable overriding `project.environment`.
pub const ENV_ENVIRONMENT: &str = "CIRRUS_ENVIRONMENT";
/// Environment variable overriding `state.bucket`.
pub const ENV_STATE_BUCKET: &str = "CIRRUS_STATE_BUCKET";
/// Environment variable overriding `state.prefix`.
pub const ENV_STATE_PREFIX: &str = "CIRRUS_STATE_PREFIX";
/// Environment variable overriding `execution.concurrency`.
pub const ENV_CONCURRENCY: &str = "CIRRUS_CONCURRENCY";

/// Parser for stack files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory the `.env` file is looked up in.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory the `.env` file is looked up in.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack file: {}", path.display());

        if !path.exists() {
            return Err(CirrusError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CirrusError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack file from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            CirrusError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack {} with {} resource(s)",
            config.qualified_name(),
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack file and applies `CIRRUS_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the `.env` file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                CirrusError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `CIRRUS_*` overrides read through `env`.
///
/// # Errors
///
/// Returns an error if `CIRRUS_CONCURRENCY` is not a positive integer.
pub fn apply_env_overrides(config: &mut StackConfig, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(name) = env(ENV_PROJECT_NAME) {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }

    if let Some(environment) = env(ENV_ENVIRONMENT) {
        debug!("Overriding project.environment from environment");
        config.project.environment = environment;
    }

    if let Some(bucket) = env(ENV_STATE_BUCKET) {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = env(ENV_STATE_PREFIX) {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }

    if let Some(raw) = env(ENV_CONCURRENCY) {
        let concurrency = raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                ConfigError::validation(
                    format!("{ENV_CONCURRENCY} must be a positive integer, got '{raw}'"),
                    "execution.concurrency",
                )
            })?;
        debug!("Overriding execution.concurrency from environment");
        config.execution.concurrency = concurrency;
    }

    Ok(())
}

/// Default stack file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["cirrus.stack.yaml", "cirrus.stack.yml", "stack.yaml"];

/// Finds the stack file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(CirrusError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
