//! Type-tag to plugin routing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProviderError;

use super::plugin::{Provider, ProviderResult};

/// Maps resource type tags to provider plugins.
///
/// Patterns are an exact type (`azure:core/ResourceGroup`), a prefix
/// ending in `*` (`azure:*`) or the catch-all `*`. Lookup prefers an exact
/// match, then the longest matching prefix, then the catch-all.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    exact: BTreeMap<String, Arc<dyn Provider>>,
    prefixes: BTreeMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin for a type pattern, replacing any previous one.
    pub fn register(&mut self, pattern: &str, provider: Arc<dyn Provider>) {
        if pattern == "*" {
            self.fallback = Some(provider);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            self.prefixes.insert(prefix.to_string(), provider);
        } else {
            self.exact.insert(pattern.to_string(), provider);
        }
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, pattern: &str, provider: Arc<dyn Provider>) -> Self {
        self.register(pattern, provider);
        self
    }

    /// Selects the plugin for a resource type.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NoProvider`] if nothing matches.
    pub fn resolve(&self, resource_type: &str) -> ProviderResult<Arc<dyn Provider>> {
        if let Some(provider) = self.exact.get(resource_type) {
            return Ok(Arc::clone(provider));
        }

        let prefixed = self
            .prefixes
            .iter()
            .filter(|(prefix, _)| resource_type.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, provider)| provider);

        prefixed
            .or(self.fallback.as_ref())
            .map(Arc::clone)
            .ok_or_else(|| ProviderError::NoProvider {
                resource_type: resource_type.to_string(),
            })
    }

    /// Returns true if no plugin is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty() && self.fallback.is_none()
    }

    /// Registered patterns, for diagnostics.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        self.exact
            .keys()
            .cloned()
            .chain(self.prefixes.keys().map(|p| format!("{p}*")))
            .chain(self.fallback.iter().map(|_| "*".to_string()))
            .collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}
