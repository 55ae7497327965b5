//! Stack file validation.
//!
//! Validation collects every problem in one pass instead of stopping at
//! the first, so `cirrus validate` can report them together. Errors block
//! a run; warnings do not.

use crate::error::{CirrusError, ConfigError, Result};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::spec::{PluginKind, ProvidersConfig, SettingSpec, StackConfig, StateBackend};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack file and returns every problem found.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_settings(&config.settings, &mut result);
        Self::validate_providers(&config.providers, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_outputs(config, &mut result);

        if config.execution.concurrency == 0 {
            result.error("execution.concurrency", "Concurrency must be at least 1");
        }

        result
    }

    /// Validates a stack file, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first) = result.errors.first() {
            return Err(CirrusError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }));
        }

        debug!("Stack validation passed with {} warning(s)", result.warnings.len());
        Ok(result)
    }

    fn validate_project(config: &StackConfig, result: &mut ValidationResult) {
        let project = &config.project;

        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        } else if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!(
                    "Environment '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.environment
                ),
            );
        }
    }

    fn validate_state(config: &StackConfig, result: &mut ValidationResult) {
        let state = &config.state;
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
                if state.path.is_some() {
                    result.warn("state.path: Ignored by the S3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result.warn("state.bucket: Ignored by the local backend");
                }
            }
        }
    }

    fn validate_settings(settings: &BTreeMap<String, SettingSpec>, result: &mut ValidationResult) {
        for (key, spec) in settings {
            let field = format!("settings.{key}");
            if !is_valid_key(key) {
                result.error(&field, format!("Setting key '{key}' must be alphanumeric with underscores"));
            }
            if let SettingSpec::Detailed(source) = spec {
                if source.value.is_none() && source.from_env.is_none() {
                    result.error(&field, "Setting needs a value or from_env");
                }
                if source.secret && source.from_env.is_none() {
                    result.warn(format!("{field}: Secret is stored inline in the stack file"));
                }
            }
        }
    }

    fn validate_providers(providers: &ProvidersConfig, result: &mut ValidationResult) {
        if providers.plugins.is_empty() {
            result.warn("providers.plugins: No plugins configured; only --simulate runs can apply");
        }

        let mut patterns = HashSet::new();
        for (i, plugin) in providers.plugins.iter().enumerate() {
            let prefix = format!("providers.plugins[{i}]");

            if plugin.kind == PluginKind::Http {
                match plugin.endpoint.as_deref() {
                    None | Some("") => {
                        result.error(format!("{prefix}.endpoint"), "HTTP plugins need an endpoint");
                    }
                    Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                        result.error(
                            format!("{prefix}.endpoint"),
                            format!("Endpoint '{endpoint}' must be an http:// or https:// URL"),
                        );
                    }
                    Some(_) => {}
                }
                if plugin.timeout_secs == Some(0) {
                    result.error(format!("{prefix}.timeout_secs"), "Timeout must be at least 1 second");
                }
            } else if plugin.endpoint.is_some() {
                result.warn(format!("{prefix}.endpoint: Ignored by simulated plugins"));
            }

            if plugin.types.is_empty() {
                result.error(format!("{prefix}.types"), "Plugin serves no resource types");
            }
            for pattern in &plugin.types {
                if pattern.is_empty() {
                    result.error(format!("{prefix}.types"), "Type pattern cannot be empty");
                } else if pattern.find('*').is_some_and(|i| i + 1 != pattern.len()) {
                    result.error(
                        format!("{prefix}.types"),
                        format!("Pattern '{pattern}' may only use '*' at the end"),
                    );
                } else if !patterns.insert(pattern.as_str()) {
                    result.warn(format!("{prefix}.types: Pattern '{pattern}' is already served; the later plugin wins"));
                }
            }
        }
    }

    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result.warn("No resources defined in stack file");
            return;
        }

        let mut seen_names = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.error(format!("{prefix}.name"), format!("Duplicate resource name: {}", resource.name));
            }

            if !is_valid_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            if resource.resource_type.trim().is_empty() {
                result.error(format!("{prefix}.type"), "Resource type cannot be empty");
            }

            for dep in &resource.explicit_deps {
                if dep.as_str() == resource.name {
                    result.error(format!("{prefix}.depends_on"), "A resource cannot depend on itself");
                }
            }
        }

        for (i, resource) in config.resources.iter().enumerate() {
            for dep in &resource.explicit_deps {
                if !seen_names.contains(dep.as_str()) {
                    result.error(
                        format!("resources[{i}].depends_on"),
                        format!("Unknown resource '{}'", dep.as_str()),
                    );
                }
            }
        }
    }

    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        let names: HashSet<&str> = config.resource_names().into_iter().collect();

        for (name, reference) in &config.outputs {
            if !names.contains(reference.resource.as_str()) {
                result.error(
                    format!("outputs.{name}"),
                    format!("Export refers to unknown resource '{}'", reference.resource),
                );
            }
        }
    }
}

/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("rg"));
        assert!(is_valid_name("aks-cluster-01"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Rg")); // uppercase
        assert!(!is_valid_name("1rg")); // starts with digit
        assert!(!is_valid_name("sql_server")); // underscore
        assert!(!is_valid_name("rg-")); // ends with hyphen
        assert!(!is_valid_name("rg--main")); // consecutive hyphens
    }

    #[test]
    fn test_valid_stack_passes_with_warnings() {
        let config = parse(
            r"
project:
  name: kzhou-platform
resources:
  - type: azure:core/ResourceGroup
    name: rg
",
        );

        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("No plugins"));
    }

    #[test]
    fn test_collects_every_error() {
        let config = parse(
            r"
project:
  name: Kzhou
state:
  backend: s3
settings:
  bad-key: 1
  empty: {}
providers:
  plugins:
    - kind: http
      types: ['azure:*:x*']
execution:
  concurrency: 0
resources:
  - type: azure:core/ResourceGroup
    name: rg
  - type: ''
    name: rg
    depends_on: [vnet]
outputs:
  registry: acr.login_server
",
        );

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"project.name"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"settings.bad-key"));
        assert!(fields.contains(&"settings.empty"));
        assert!(fields.contains(&"providers.plugins[0].endpoint"));
        assert!(fields.contains(&"providers.plugins[0].types"));
        assert!(fields.contains(&"execution.concurrency"));
        assert!(fields.contains(&"resources[1].name"));
        assert!(fields.contains(&"resources[1].type"));
        assert!(fields.contains(&"resources[1].depends_on"));
        assert!(fields.contains(&"outputs.registry"));

        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = parse(include_str!("../../templates/cirrus.stack.yaml"));
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(result.warning_count(), 0);

        let settings = crate::config::Settings::resolve(&config.settings, |name| {
            (name == "CIRRUS_PROVIDER_TOKEN").then(|| "t0ken".to_string())
        })
        .unwrap();
        let declaration = config.declaration(&settings).unwrap();
        let context = config.provider_context(&settings).unwrap();
        let graph = crate::graph::GraphBuilder::new().build(&declaration.resources).unwrap();

        assert_eq!(graph.len(), 6);
        assert_eq!(graph.dependencies("apps").into_iter().collect::<Vec<_>>(), vec!["aks"]);
        assert_eq!(context.credentials["token"], "t0ken");
        assert_eq!(context.location.as_deref(), Some("eastus"));
    }
}
