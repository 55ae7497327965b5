//! In-memory provider.
//!
//! Keeps every "remote" object in a map and echoes properties back as
//! outputs. It backs `apply --simulate` and stands in for real plugins in
//! tests, where it can be told to fail specific resources. Handles made
//! by [`Provider::configure`] share the same objects and remember the
//! context each resource was applied with.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;

use super::plugin::{
    Created, Outputs, Provider, ProviderContext, ProviderRequest, ProviderResult, ResolvedDiff, ResourceId,
};

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Outputs>,
    counter: u64,
    failing: BTreeSet<String>,
    calls: Vec<String>,
    timeline: Vec<String>,
    contexts: BTreeMap<String, ProviderContext>,
}

#[derive(Debug, Default)]
struct Shared {
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Deterministic in-memory provider.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    name: String,
    delay: Option<Duration>,
    context: ProviderContext,
    shared: Arc<Shared>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::named("simulated")
    }
}

impl SimulatedProvider {
    /// Creates an empty simulated provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty simulated provider with a custom name.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            context: ProviderContext::default(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Makes every call take at least `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every call for the named resource fail.
    #[must_use]
    pub fn with_failure(self, resource: &str) -> Self {
        self.fail(resource);
        self
    }

    /// Makes every call for the named resource fail.
    pub fn fail(&self, resource: &str) {
        self.lock().failing.insert(resource.to_string());
    }

    /// Stops failing calls for every resource.
    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Calls made so far, as `"<operation> <name>"`, in the order they started.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Starts (`"> create rg"`) and successful returns (`"< create rg"`) in
    /// the order they happened.
    #[must_use]
    pub fn timeline(&self) -> Vec<String> {
        self.lock().timeline.clone()
    }

    /// Context the named resource was last applied with.
    #[must_use]
    pub fn context_of(&self, resource: &str) -> Option<ProviderContext> {
        self.lock().contexts.get(resource).cloned()
    }

    /// Number of objects that currently exist.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns the stored outputs of an object.
    #[must_use]
    pub fn object(&self, provider_id: &str) -> Option<Outputs> {
        self.lock().objects.get(provider_id).cloned()
    }

    /// Changes an output out of band, as if someone edited the real object.
    pub fn set_output(&self, provider_id: &str, key: &str, value: serde_json::Value) {
        if let Some(outputs) = self.lock().objects.get_mut(provider_id) {
            outputs.insert(key.to_string(), value);
        }
    }

    /// Deletes an object out of band.
    pub fn forget(&self, provider_id: &str) {
        self.lock().objects.remove(provider_id);
    }

    /// Highest number of calls that were running at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call and fails it if the resource is marked failing.
    fn enter(&self, operation: &str, name: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.calls.push(format!("{operation} {name}"));
        inner.timeline.push(format!("> {operation} {name}"));
        if inner.failing.contains(name) {
            return Err(ProviderError::failed(operation, name, "simulated failure"));
        }
        inner.contexts.insert(name.to_string(), self.context.clone());
        Ok(())
    }

    fn leave(&self, operation: &str, name: &str) {
        self.lock().timeline.push(format!("< {operation} {name}"));
    }

    async fn pace(&self) {
        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Lowercased last segment of a type tag: `azure:core/ResourceGroup` -> `resourcegroup`.
fn type_suffix(resource_type: &str) -> String {
    resource_type
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(resource_type)
        .to_lowercase()
}

fn echo(properties: &Outputs, provider_id: &str, name: &str) -> Outputs {
    let mut outputs = properties.clone();
    outputs.insert("id".to_string(), serde_json::Value::String(provider_id.to_string()));
    outputs
        .entry("name")
        .or_insert_with(|| serde_json::Value::String(name.to_string()));
    outputs
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, request: &ProviderRequest) -> ProviderResult<Created> {
        self.enter("create", &request.name)?;
        self.pace().await;

        let mut inner = self.lock();
        inner.counter += 1;
        let provider_id = format!(
            "{}-{}-{}",
            type_suffix(&request.resource_type),
            request.name,
            inner.counter
        );
        let outputs = echo(&request.properties, &provider_id, &request.name);
        inner.objects.insert(provider_id.clone(), outputs.clone());
        drop(inner);

        debug!("Simulated create {} -> {provider_id}", request.name);
        self.leave("create", &request.name);
        Ok(Created { provider_id, outputs })
    }

    async fn read(&self, target: &ResourceId) -> ProviderResult<Outputs> {
        self.enter("read", &target.name)?;
        self.pace().await;

        self.lock()
            .objects
            .get(&target.provider_id)
            .cloned()
            .ok_or_else(|| target.not_found())
    }

    async fn update(&self, target: &ResourceId, diff: &ResolvedDiff) -> ProviderResult<Outputs> {
        self.enter("update", &target.name)?;
        self.pace().await;

        // Objects from an earlier process are adopted rather than rejected.
        let outputs = echo(&diff.properties, &target.provider_id, &target.name);
        self.lock()
            .objects
            .insert(target.provider_id.clone(), outputs.clone());

        debug!(
            "Simulated update {} ({})",
            target,
            diff.changed_fields.join(", ")
        );
        self.leave("update", &target.name);
        Ok(outputs)
    }

    async fn delete(&self, target: &ResourceId) -> ProviderResult<()> {
        self.enter("delete", &target.name)?;
        self.pace().await;

        self.lock()
            .objects
            .remove(&target.provider_id)
            .ok_or_else(|| target.not_found())?;
        self.leave("delete", &target.name);
        Ok(())
    }

    fn configure(&self, overlay: &ProviderContext) -> ProviderResult<Arc<dyn Provider>> {
        Ok(Arc::new(Self {
            context: self.context.layered(overlay),
            ..self.clone()
        }))
    }
}
