//! Desired-resource declarations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::value::{OutputReference, Value};

/// Opaque handle naming exactly one resource within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(String);

/// A single desired resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Resource type tag used to select a provider plugin.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique within the graph.
    pub name: String,
    /// Desired properties.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Ordering constraints that are not visible through property references.
    #[serde(default, rename = "depends_on")]
    pub explicit_deps: BTreeSet<ResourceRef>,
    /// Property keys whose values are secret and never displayed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sensitive: BTreeSet<String>,
    /// Provider settings for this resource only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderOverrides>,
}

/// Provider settings layered over the run's context for one resource.
///
/// Values may reference outputs of other resources, e.g. a cluster's
/// kubeconfig handed to the provider that manages workloads inside it.
/// They are resolved when the resource is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOverrides {
    /// Location or region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    /// Credentials by key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, Value>,
    /// Tags by key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
}

/// The full input of one run: resources in declaration order plus exports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declaration {
    /// Declared resources.
    pub resources: Vec<ResourceNode>,
    /// Exported outputs: export name to the output it publishes.
    pub exports: BTreeMap<String, OutputReference>,
}

impl ResourceRef {
    /// Creates a reference to the named resource.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the referenced name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ResourceRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ResourceNode {
    /// Creates a resource with no properties.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            properties: BTreeMap::new(),
            explicit_deps: BTreeSet::new(),
            sensitive: BTreeSet::new(),
            provider: None,
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets a property whose value is secret.
    #[must_use]
    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        self.sensitive.insert(key.clone());
        self.properties.insert(key, value.into());
        self
    }

    /// Sets per-resource provider settings.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderOverrides) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Adds an explicit ordering dependency.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<ResourceRef>) -> Self {
        self.explicit_deps.insert(name.into());
        self
    }

    /// Returns a reference to this resource.
    #[must_use]
    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef::new(self.name.clone())
    }

    /// Every output reference held in the property bag or provider settings.
    #[must_use]
    pub fn output_references(&self) -> Vec<&OutputReference> {
        self.properties
            .values()
            .flat_map(Value::references)
            .chain(self.provider.iter().flat_map(ProviderOverrides::references))
            .collect()
    }

    /// A copy safe to display: secret properties masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            properties: redact_properties(&self.properties, &self.sensitive),
            provider: self.provider.as_ref().map(ProviderOverrides::redacted),
            ..self.clone()
        }
    }

    /// Resources this node must be applied after, explicit and inferred, sorted.
    #[must_use]
    pub fn dependency_names(&self) -> BTreeSet<String> {
        self.explicit_deps
            .iter()
            .map(|r| r.as_str().to_string())
            .chain(self.output_references().into_iter().map(|r| r.resource.clone()))
            .collect()
    }
}

impl ProviderOverrides {
    /// Sets a credential.
    #[must_use]
    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    /// Every value, location first.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.location
            .iter()
            .chain(self.credentials.values())
            .chain(self.tags.values())
    }

    /// Output references held in any value.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputReference> {
        self.values().flat_map(Value::references).collect()
    }

    /// A copy with literal credentials masked. References stay visible.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            credentials: self
                .credentials
                .iter()
                .map(|(k, v)| {
                    let shown = if v.is_literal() { Value::masked() } else { v.clone() };
                    (k.clone(), shown)
                })
                .collect(),
            ..self.clone()
        }
    }
}

/// Masks the values of `sensitive` keys.
#[must_use]
pub fn redact_properties(
    properties: &BTreeMap<String, Value>,
    sensitive: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    properties
        .iter()
        .map(|(k, v)| {
            let shown = if sensitive.contains(k) { Value::masked() } else { v.clone() };
            (k.clone(), shown)
        })
        .collect()
}

impl Declaration {
    /// Creates a declaration from resources with no exports.
    #[must_use]
    pub const fn new(resources: Vec<ResourceNode>) -> Self {
        Self {
            resources,
            exports: BTreeMap::new(),
        }
    }

    /// Adds an export.
    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>, reference: OutputReference) -> Self {
        self.exports.insert(name.into(), reference);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_names_merge_explicit_and_inferred() {
        let aks = ResourceNode::new("azure:containerservice/KubernetesCluster", "aks")
            .with_property("location", Value::reference("rg", "location"))
            .with_property("subnet_id", Value::reference("subnet", "id"))
            .depends_on("acr-permissions")
            .depends_on("subnet");

        let deps: Vec<String> = aks.dependency_names().into_iter().collect();
        assert_eq!(deps, vec!["acr-permissions", "rg", "subnet"]);
    }

    #[test]
    fn test_node_serde_uses_type_and_depends_on() {
        let node = ResourceNode::new("azure:core/ResourceGroup", "rg")
            .with_property("location", "east us")
            .depends_on("app");

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "azure:core/ResourceGroup");
        assert_eq!(json["depends_on"], serde_json::json!(["app"]));

        let back: ResourceNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
        assert!(serde_json::to_value(&node).unwrap().get("sensitive").is_none());
    }

    #[test]
    fn test_provider_references_are_dependencies() {
        let namespace = ResourceNode::new("kubernetes:core/v1:Namespace", "ns")
            .with_property("name", "kzhou")
            .with_provider(
                ProviderOverrides::default()
                    .with_credential("kubeconfig", Value::reference("aks", "kube_config_raw")),
            );

        let deps: Vec<String> = namespace.dependency_names().into_iter().collect();
        assert_eq!(deps, vec!["aks"]);
        assert_eq!(namespace.output_references().len(), 1);
    }

    #[test]
    fn test_redacted_masks_secrets_only() {
        let node = ResourceNode::new("azure:sql/Server", "sql")
            .with_property("version", "12.0")
            .with_secret("administrator_login_password", "hunter2")
            .with_provider(
                ProviderOverrides::default()
                    .with_credential("token", "s3cr3t")
                    .with_credential("kubeconfig", Value::reference("aks", "kube_config_raw")),
            );

        let shown = node.redacted();
        assert_eq!(shown.properties["version"], Value::string("12.0"));
        assert_eq!(shown.properties["administrator_login_password"], Value::masked());
        let provider = shown.provider.unwrap();
        assert_eq!(provider.credentials["token"], Value::masked());
        assert_eq!(
            provider.credentials["kubeconfig"],
            Value::reference("aks", "kube_config_raw")
        );
        assert_eq!(node.properties["administrator_login_password"], Value::string("hunter2"));
    }
}
