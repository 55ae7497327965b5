//! The provider plugin contract.
//!
//! A provider knows how to create, read, update and delete one family of
//! resource types. The engine never interprets properties or outputs; it
//! only resolves references before a call and stores what comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::model::{OutputReference, ProviderOverrides, Value};

/// Outputs reported by a provider for one resource.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Settings shared by every provider in a run.
///
/// Built once from configuration and handed to plugins at construction.
/// Resources with their own provider settings get a copy with those
/// settings layered on top.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderContext {
    /// Default location or region.
    #[serde(default)]
    pub location: Option<String>,
    /// Credentials by key, e.g. `token`.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    /// Tags every provider should stamp on what it creates.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("location", &self.location)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("tags", &self.tags)
            .finish()
    }
}

impl ProviderContext {
    /// Returns a credential by key.
    #[must_use]
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }

    /// This context with `overlay` on top: its location wins when set, its
    /// credentials and tags replace same-named entries.
    #[must_use]
    pub fn layered(&self, overlay: &Self) -> Self {
        let mut merged = self.clone();
        if overlay.location.is_some() {
            merged.location.clone_from(&overlay.location);
        }
        merged.credentials.extend(overlay.credentials.clone());
        merged.tags.extend(overlay.tags.clone());
        merged
    }

    /// Resolves per-resource provider settings against applied outputs.
    ///
    /// Non-string values are rendered as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::MissingOutput`] when a referenced output is
    /// not available.
    pub fn from_overrides<F>(overrides: &ProviderOverrides, lookup: &F) -> ProviderResult<Self>
    where
        F: Fn(&OutputReference) -> Option<serde_json::Value>,
    {
        let text = |value: &Value| -> ProviderResult<String> {
            Ok(match value.resolve(lookup)? {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        };
        let texts = |map: &BTreeMap<String, Value>| {
            map.iter()
                .map(|(k, v)| Ok((k.clone(), text(v)?)))
                .collect::<ProviderResult<BTreeMap<_, _>>>()
        };

        Ok(Self {
            location: overrides.location.as_ref().map(text).transpose()?,
            credentials: texts(&overrides.credentials)?,
            tags: texts(&overrides.tags)?,
        })
    }
}

/// Identifies an existing remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    /// Resource type tag.
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Handle returned by `create`.
    pub provider_id: String,
}

/// A create call with every reference already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequest {
    /// Resource type tag.
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Fully resolved properties.
    pub properties: Outputs,
}

/// An update call: the full resolved desired properties plus what changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDiff {
    /// Fully resolved desired properties.
    pub properties: Outputs,
    /// Top-level keys whose value differs from the last apply, sorted.
    pub changed_fields: Vec<String>,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Opaque handle for later calls.
    pub provider_id: String,
    /// Outputs known after creation.
    pub outputs: Outputs,
}

/// A resource provider plugin.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Creates the remote object.
    async fn create(&self, request: &ProviderRequest) -> ProviderResult<Created>;

    /// Reads current outputs, or `NotFound` if the object is gone.
    async fn read(&self, target: &ResourceId) -> ProviderResult<Outputs>;

    /// Applies changed properties in place.
    async fn update(&self, target: &ResourceId, diff: &ResolvedDiff) -> ProviderResult<Outputs>;

    /// Deletes the remote object.
    async fn delete(&self, target: &ResourceId) -> ProviderResult<()>;

    /// A handle on the same plugin with `overlay` layered over its context.
    ///
    /// Used for resources that declare their own provider settings.
    fn configure(&self, overlay: &ProviderContext) -> ProviderResult<Arc<dyn Provider>>;
}

impl ResourceId {
    /// Creates a resource identifier.
    #[must_use]
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider_id: provider_id.into(),
        }
    }

    /// The `NotFound` error for this object.
    #[must_use]
    pub fn not_found(&self) -> ProviderError {
        ProviderError::NotFound {
            resource_type: self.resource_type.clone(),
            provider_id: self.provider_id.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.provider_id)
    }
}
