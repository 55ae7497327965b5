//! Stack file configuration.
//!
//! This module handles everything between `cirrus.stack.yaml` and the
//! engine:
//! - Parsing the stack file and applying `CIRRUS_*` overrides
//! - Resolving settings and expanding `${...}` placeholders
//! - Validation with errors and warnings
//! - Building the provider registry and state store
//! - Fingerprinting declarations

mod build;
mod hash;
mod interpolate;
mod parser;
mod spec;
mod validator;

pub use build::{build_registry, open_state_store};
pub use hash::ConfigHasher;
pub use interpolate::Settings;
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_CONCURRENCY, ENV_ENVIRONMENT, ENV_PROJECT_NAME,
    ENV_STATE_BUCKET, ENV_STATE_PREFIX, apply_env_overrides, find_config_file,
};
pub use spec::{
    ContextConfig, ExecutionConfig, PluginConfig, PluginKind, ProjectConfig, ProvidersConfig,
    SettingSource, SettingSpec, StackConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
