//! Stack file types.
//!
//! This module defines the structs that map to `cirrus.stack.yaml`. A stack
//! file describes one project environment: where its state lives, the
//! settings it is parameterised by, which provider plugins serve which
//! resource types, and the resources and exports themselves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{OutputReference, ResourceNode};

/// The root of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Named settings available to `${settings.<key>}` placeholders.
    #[serde(default)]
    pub settings: BTreeMap<String, SettingSpec>,
    /// Provider plugin configuration.
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceNode>,
    /// Exported outputs: export name to `<resource>.<output>`.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputReference>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Environment (e.g. "dev", "prod"); one state snapshot per environment.
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix; defaults to `<project>/<environment>`.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (uses the AWS default chain if unset).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for the local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Where a setting's value comes from.
///
/// A bare scalar is shorthand for `{ value: <scalar> }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SettingSpec {
    /// Full form.
    Detailed(SettingSource),
    /// Inline literal.
    Literal(serde_json::Value),
}

/// Full form of a setting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SettingSource {
    /// Literal value, used as the default when `from_env` is also set.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Environment variable to read the value from.
    #[serde(default)]
    pub from_env: Option<String>,
    /// Masks the value in output.
    #[serde(default)]
    pub secret: bool,
}

/// Provider plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvidersConfig {
    /// Context handed to every plugin.
    #[serde(default)]
    pub context: ContextConfig,
    /// Plugins and the type patterns they serve.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// Provider context before settings are interpolated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextConfig {
    /// Default location or region.
    #[serde(default)]
    pub location: Option<String>,
    /// Credentials by key.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    /// Tags stamped on created resources.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// One provider plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    /// Transport.
    pub kind: PluginKind,
    /// Type patterns: exact tag, `prefix*`, or `*`.
    #[serde(default = "default_types")]
    pub types: Vec<String>,
    /// Plugin server URL (http plugins).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds (http plugins).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Retries for retryable failures (http plugins).
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Plugin transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// In-memory simulation.
    Simulated,
    /// JSON over HTTP to a plugin server.
    Http,
}

/// Execution tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum concurrent provider calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_types() -> Vec<String> {
    vec![String::from("*")]
}

const fn default_concurrency() -> usize {
    crate::planner::DEFAULT_CONCURRENCY
}

impl StackConfig {
    /// Returns the qualified name (project-environment).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns all declared resource names.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// S3 key prefix, defaulting to `<project>/<environment>`.
    #[must_use]
    pub fn state_prefix(&self) -> String {
        self.state.prefix.clone().unwrap_or_else(|| {
            format!("{}/{}", self.project.name, self.project.environment)
        })
    }
}

impl SettingSpec {
    /// Returns true if the value must be masked.
    #[must_use]
    pub const fn is_secret(&self) -> bool {
        matches!(self, Self::Detailed(SettingSource { secret: true, .. }))
    }
}
