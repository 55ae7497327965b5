//! Settings resolution and `${...}` placeholder expansion.
//!
//! Two placeholder forms are understood inside string values:
//!
//! - `${settings.<key>}` is replaced by the setting's value. When the
//!   placeholder is the whole string the setting keeps its JSON type,
//!   otherwise it is spliced in as text.
//! - `${<resource>.<output>}` as the whole string becomes an output
//!   reference. References cannot be embedded in longer strings because
//!   they are only known at apply time.
//!
//! `$${` escapes a literal `${`.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::model::{Declaration, MASK, OutputReference, ProviderOverrides, ResourceNode, Value};
use crate::provider::ProviderContext;

use super::spec::{SettingSource, SettingSpec, StackConfig};

const SETTINGS_PREFIX: &str = "settings.";

/// Resolved settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: BTreeMap<String, serde_json::Value>,
    secrets: BTreeSet<String>,
}

impl Settings {
    /// Resolves every setting, reading environment variables through `env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] when a setting reads from an
    /// unset variable and has no default.
    pub fn resolve(
        specs: &BTreeMap<String, SettingSpec>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut settings = Self::default();

        for (key, spec) in specs {
            let value = match spec {
                SettingSpec::Literal(value) => value.clone(),
                SettingSpec::Detailed(SettingSource {
                    value,
                    from_env,
                    secret,
                }) => {
                    if *secret {
                        settings.secrets.insert(key.clone());
                    }
                    match (from_env.as_deref().and_then(&env), value, from_env) {
                        (Some(found), _, _) => serde_json::Value::String(found),
                        (None, Some(default), _) => default.clone(),
                        (None, None, Some(var)) => {
                            return Err(ConfigError::MissingEnvVar { name: var.clone() }.into());
                        }
                        (None, None, None) => {
                            return Err(ConfigError::validation(
                                "Setting needs a value or from_env",
                                format!("settings.{key}"),
                            )
                            .into());
                        }
                    }
                }
            };
            settings.values.insert(key.clone(), value);
        }

        debug!("Resolved {} setting(s)", settings.values.len());
        Ok(settings)
    }

    /// Returns a setting's value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Returns true if the setting is secret.
    #[must_use]
    pub fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains(key)
    }

    /// Settings for display, secrets masked.
    #[must_use]
    pub fn masked(&self) -> BTreeMap<String, serde_json::Value> {
        self.values
            .iter()
            .map(|(key, value)| {
                let shown = if self.is_secret(key) {
                    serde_json::Value::String(MASK.to_string())
                } else {
                    value.clone()
                };
                (key.clone(), shown)
            })
            .collect()
    }

    /// Returns true if the raw value mentions a secret setting anywhere.
    fn mentions_secret(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self
                .secrets
                .iter()
                .any(|key| s.contains(&format!("${{{SETTINGS_PREFIX}{key}}}"))),
            Value::List(items) => items.iter().any(|v| self.mentions_secret(v)),
            Value::Map(map) => map.values().any(|v| self.mentions_secret(v)),
            _ => false,
        }
    }

    fn lookup(&self, key: &str, location: &str) -> Result<&serde_json::Value> {
        self.values.get(key).ok_or_else(|| {
            ConfigError::UndefinedSetting {
                name: key.to_string(),
                location: location.to_string(),
            }
            .into()
        })
    }
}

impl StackConfig {
    /// Builds the declaration the engine consumes, with placeholders expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if a placeholder is malformed or names an undefined
    /// setting.
    pub fn declaration(&self, settings: &Settings) -> Result<Declaration> {
        let resources = self
            .resources
            .iter()
            .map(|node| expand_node(node, settings))
            .collect::<Result<Vec<_>>>()?;

        Ok(Declaration {
            resources,
            exports: self.outputs.clone(),
        })
    }

    /// Builds the provider context with placeholders expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if a placeholder is malformed or names an undefined
    /// setting.
    pub fn provider_context(&self, settings: &Settings) -> Result<ProviderContext> {
        let context = &self.providers.context;
        let text = |value: &str, location: String| expand_text(value, settings, &location);

        Ok(ProviderContext {
            location: context
                .location
                .as_deref()
                .map(|l| text(l, "providers.context.location".to_string()))
                .transpose()?,
            credentials: context
                .credentials
                .iter()
                .map(|(k, v)| Ok((k.clone(), text(v, format!("providers.context.credentials.{k}"))?)))
                .collect::<Result<_>>()?,
            tags: context
                .tags
                .iter()
                .map(|(k, v)| Ok((k.clone(), text(v, format!("providers.context.tags.{k}"))?)))
                .collect::<Result<_>>()?,
        })
    }
}

/// Expands placeholders in one resource.
///
/// Properties that pull in a secret setting are added to the node's
/// sensitive keys so they are masked wherever the node is shown.
fn expand_node(node: &ResourceNode, settings: &Settings) -> Result<ResourceNode> {
    let properties = node
        .properties
        .iter()
        .map(|(key, value)| {
            let location = format!("resources.{}.properties.{key}", node.name);
            Ok((key.clone(), expand_value(value, settings, &location)?))
        })
        .collect::<Result<_>>()?;

    let mut sensitive = node.sensitive.clone();
    sensitive.extend(
        node.properties
            .iter()
            .filter(|(_, value)| settings.mentions_secret(value))
            .map(|(key, _)| key.clone()),
    );

    let provider = node
        .provider
        .as_ref()
        .map(|p| expand_overrides(p, settings, &format!("resources.{}.provider", node.name)))
        .transpose()?;

    Ok(ResourceNode {
        properties,
        sensitive,
        provider,
        ..node.clone()
    })
}

fn expand_overrides(overrides: &ProviderOverrides, settings: &Settings, location: &str) -> Result<ProviderOverrides> {
    let expand_map = |map: &BTreeMap<String, Value>, section: &str| {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), expand_value(v, settings, &format!("{location}.{section}.{k}"))?)))
            .collect::<Result<BTreeMap<_, _>>>()
    };

    Ok(ProviderOverrides {
        location: overrides
            .location
            .as_ref()
            .map(|v| expand_value(v, settings, &format!("{location}.location")))
            .transpose()?,
        credentials: expand_map(&overrides.credentials, "credentials")?,
        tags: expand_map(&overrides.tags, "tags")?,
    })
}

fn expand_value(value: &Value, settings: &Settings, location: &str) -> Result<Value> {
    Ok(match value {
        Value::String(s) => expand_string(s, settings, location)?,
        Value::List(items) => Value::List(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| expand_value(v, settings, &format!("{location}[{i}]")))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), expand_value(v, settings, &format!("{location}.{k}"))?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

/// A string that is exactly one placeholder keeps the placeholder's type.
fn expand_string(s: &str, settings: &Settings, location: &str) -> Result<Value> {
    if let Some(inner) = whole_placeholder(s) {
        if let Some(key) = inner.strip_prefix(SETTINGS_PREFIX) {
            return Ok(Value::from_json(settings.lookup(key, location)?.clone()));
        }
        let reference = inner
            .parse::<OutputReference>()
            .map_err(|_| invalid(s, location))?;
        return Ok(Value::Reference(reference));
    }

    expand_text(s, settings, location).map(Value::String)
}

/// Splices settings into text.
fn expand_text(s: &str, settings: &Settings, location: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        if let Some(after) = tail.strip_prefix("$${") {
            out.push_str("${");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            let end = after.find('}').ok_or_else(|| invalid(tail, location))?;
            let inner = &after[..end];
            let key = inner
                .strip_prefix(SETTINGS_PREFIX)
                .ok_or_else(|| invalid(&tail[..end + 3], location))?;
            match settings.lookup(key, location)? {
                serde_json::Value::String(text) => out.push_str(text),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        } else {
            out.push('$');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains(['$', '{', '}'])).then_some(inner)
}

fn invalid(placeholder: &str, location: &str) -> crate::error::CirrusError {
    ConfigError::InvalidPlaceholder {
        placeholder: placeholder.to_string(),
        location: location.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CirrusError;
    use serde_json::json;

    fn settings() -> Settings {
        let specs: BTreeMap<String, SettingSpec> = serde_yaml::from_str(
            r"
location: eastus
node_count: 3
prefix: kzhou
sql_password:
  from_env: SQL_PASSWORD
  secret: true
",
        )
        .unwrap();
        Settings::resolve(&specs, |var| (var == "SQL_PASSWORD").then(|| "hunter2".to_string())).unwrap()
    }

    #[test]
    fn test_resolve_from_env_and_mask() {
        let settings = settings();

        assert_eq!(settings.get("sql_password"), Some(&json!("hunter2")));
        assert_eq!(settings.masked()["sql_password"], json!("********"));
        assert_eq!(settings.masked()["location"], json!("eastus"));
    }

    #[test]
    fn test_missing_env_without_default() {
        let specs: BTreeMap<String, SettingSpec> =
            serde_yaml::from_str("token:\n  from_env: PLUGIN_TOKEN\n").unwrap();

        let err = Settings::resolve(&specs, |_| None).unwrap_err();
        assert!(matches!(err, CirrusError::Config(ConfigError::MissingEnvVar { ref name }) if name == "PLUGIN_TOKEN"));

        let specs: BTreeMap<String, SettingSpec> =
            serde_yaml::from_str("token:\n  from_env: PLUGIN_TOKEN\n  value: local\n").unwrap();
        assert_eq!(Settings::resolve(&specs, |_| None).unwrap().get("token"), Some(&json!("local")));
    }

    #[test]
    fn test_whole_placeholders_keep_type() {
        let settings = settings();

        assert_eq!(
            expand_string("${settings.node_count}", &settings, "x").unwrap(),
            Value::from(3)
        );
        assert_eq!(
            expand_string("${subnet.id}", &settings, "x").unwrap(),
            Value::reference("subnet", "id")
        );
    }

    #[test]
    fn test_embedded_settings_become_text() {
        let settings = settings();

        assert_eq!(
            expand_text("${settings.prefix}-acr-${settings.node_count}", &settings, "x").unwrap(),
            "kzhou-acr-3"
        );
        assert_eq!(expand_text("cost: $5 $${literal}", &settings, "x").unwrap(), "cost: $5 ${literal}");
    }

    #[test]
    fn test_bad_placeholders() {
        let settings = settings();

        let err = expand_text("${settings.missing}", &settings, "resources.rg").unwrap_err();
        assert!(matches!(err, CirrusError::Config(ConfigError::UndefinedSetting { .. })));

        let err = expand_text("id-${subnet.id}", &settings, "resources.rg").unwrap_err();
        assert!(matches!(err, CirrusError::Config(ConfigError::InvalidPlaceholder { .. })));

        assert!(expand_text("${settings.prefix", &settings, "x").is_err());
        assert!(expand_string("${subnet}", &settings, "x").is_err());
    }

    #[test]
    fn test_nested_values_expand() {
        let settings = settings();
        let node = ResourceNode::new("azure:containerservice/KubernetesCluster", "aks").with_property(
            "default_node_pool",
            Value::Map(BTreeMap::from([
                ("node_count".to_string(), Value::string("${settings.node_count}")),
                ("vnet_subnet_id".to_string(), Value::string("${subnet.id}")),
            ])),
        );

        let expanded = expand_node(&node, &settings).unwrap();
        let Value::Map(pool) = &expanded.properties["default_node_pool"] else {
            panic!("expected a map");
        };
        assert_eq!(pool["node_count"], Value::from(3));
        assert_eq!(pool["vnet_subnet_id"], Value::reference("subnet", "id"));
    }

    #[test]
    fn test_secret_settings_mark_properties_sensitive() {
        let settings = settings();
        let node = ResourceNode::new("azure:sql/Server", "sql")
            .with_property("administrator_login_password", "${settings.sql_password}")
            .with_property("connection", "Server=sql;Password=${settings.sql_password}")
            .with_property("location", "${settings.location}");

        let expanded = expand_node(&node, &settings).unwrap();

        assert_eq!(
            expanded.sensitive.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["administrator_login_password", "connection"]
        );
        assert_eq!(expanded.properties["administrator_login_password"], Value::string("hunter2"));
        assert_eq!(
            expanded.redacted().properties["administrator_login_password"],
            Value::string(MASK)
        );
    }

    #[test]
    fn test_provider_overrides_expand() {
        let settings = settings();
        let node = ResourceNode::new("kubernetes:core/v1:Namespace", "ns").with_provider(ProviderOverrides {
            location: Some(Value::string("${settings.location}")),
            credentials: BTreeMap::from([(
                "kubeconfig".to_string(),
                Value::string("${aks.kube_config_raw}"),
            )]),
            tags: BTreeMap::new(),
        });

        let expanded = expand_node(&node, &settings).unwrap();
        let provider = expanded.provider.as_ref().unwrap();

        assert_eq!(provider.location, Some(Value::string("eastus")));
        assert_eq!(
            provider.credentials["kubeconfig"],
            Value::reference("aks", "kube_config_raw")
        );
        assert!(expanded.dependency_names().contains("aks"));
    }
}
