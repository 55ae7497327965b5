//! Turns a parsed stack file into live engine parts: the provider
//! registry and the state store.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::provider::{DEFAULT_TIMEOUT_SECS, HttpProvider, Provider, ProviderContext, ProviderRegistry, SimulatedProvider};
use crate::state::{LocalStateStore, S3StateStore, StateStore};

use super::spec::{PluginKind, ProvidersConfig, StackConfig, StateBackend};

/// Builds the provider registry.
///
/// With `simulate`, every type is served by one in-memory plugin and the
/// configured plugins are ignored.
///
/// # Errors
///
/// Returns an error if an HTTP plugin has no usable endpoint.
pub fn build_registry(
    providers: &ProvidersConfig,
    context: &ProviderContext,
    simulate: bool,
) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if simulate {
        info!("Using the simulated provider for every resource type");
        registry.register("*", Arc::new(SimulatedProvider::new()));
        return Ok(registry);
    }

    for (i, plugin) in providers.plugins.iter().enumerate() {
        let provider: Arc<dyn Provider> = match plugin.kind {
            PluginKind::Simulated => Arc::new(SimulatedProvider::named(&format!("simulated-{i}"))),
            PluginKind::Http => {
                let endpoint = plugin.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::validation(
                        "HTTP plugins need an endpoint",
                        format!("providers.plugins[{i}].endpoint"),
                    )
                })?;
                let timeout = plugin.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
                let mut http = HttpProvider::new(endpoint, context.clone(), timeout).map_err(|e| {
                    ConfigError::validation(e.to_string(), format!("providers.plugins[{i}].endpoint"))
                })?;
                if let Some(retries) = plugin.max_retries {
                    http = http.with_retries(retries, Duration::from_secs(1));
                }
                Arc::new(http)
            }
        };

        for pattern in &plugin.types {
            debug!("Registering {} for '{pattern}'", provider.name());
            registry.register(pattern, Arc::clone(&provider));
        }
    }

    Ok(registry)
}

/// Opens the configured state store.
///
/// # Errors
///
/// Returns an error if the backend cannot be initialised.
pub async fn open_state_store(config: &StackConfig) -> Result<Box<dyn StateStore>> {
    let state = &config.state;

    match state.backend {
        StateBackend::Local => {
            let store = match &state.path {
                Some(path) => LocalStateStore::with_state_path(path),
                None => LocalStateStore::new()?,
            };
            debug!("Local state at {}", store.state_path().display());
            Ok(Box::new(store))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 bucket name is required when using S3 backend", "state.bucket")
            })?;
            let prefix = config.state_prefix();
            let store = S3StateStore::new(bucket, Some(&prefix), state.region.as_deref()).await?;
            Ok(Box::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, PluginConfig, StackConfig};
    use tempfile::TempDir;

    fn plugins(yaml: &str) -> ProvidersConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_registry_from_plugins() {
        let providers = plugins(
            r"
plugins:
  - kind: http
    endpoint: http://localhost:7300
    types: ['azure:*']
    max_retries: 1
  - kind: simulated
    types: ['kubernetes:*', 'azure:authorization/RoleAssignment']
",
        );

        let registry = build_registry(&providers, &ProviderContext::default(), false).unwrap();

        assert!(
            registry
                .resolve("azure:core/ResourceGroup")
                .ok()
                .unwrap()
                .name()
                .starts_with("http://localhost:7300")
        );
        assert_eq!(registry.resolve("azure:authorization/RoleAssignment").ok().unwrap().name(), "simulated-1");
        assert_eq!(registry.resolve("kubernetes:apps/Deployment").ok().unwrap().name(), "simulated-1");
        assert!(registry.resolve("aws:s3/Bucket").is_err());
    }

    #[test]
    fn test_simulate_overrides_plugins() {
        let providers = plugins("plugins:\n  - kind: http\n    endpoint: http://localhost:7300\n");

        let registry = build_registry(&providers, &ProviderContext::default(), true).unwrap();

        assert_eq!(registry.resolve("anything").ok().unwrap().name(), "simulated");
    }

    #[test]
    fn test_http_plugin_without_endpoint() {
        let providers = ProvidersConfig {
            plugins: vec![PluginConfig {
                kind: PluginKind::Http,
                types: vec!["*".to_string()],
                endpoint: None,
                timeout_secs: None,
                max_retries: None,
            }],
            ..ProvidersConfig::default()
        };

        assert!(build_registry(&providers, &ProviderContext::default(), false).is_err());
    }

    #[tokio::test]
    async fn test_open_local_store_at_custom_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("envs").join("dev.json");
        let mut config: StackConfig = ConfigParser::new()
            .parse_yaml("project:\n  name: kzhou-platform\n", None)
            .unwrap();
        config.state.path = Some(path.display().to_string());

        let store = open_state_store(&config).await.unwrap();

        assert_eq!(store.backend_type(), "local");
        assert!(!store.exists().await.unwrap());
    }
}
