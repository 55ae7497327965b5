//! Plan executor.
//!
//! Applies a plan against provider plugins. Independent changes run
//! concurrently on a [`JoinSet`], bounded by a [`Semaphore`]; a change is
//! only spawned once every change it depends on has succeeded. The
//! scheduler loop is the only owner of the state session, so every state
//! write happens between task completions. While calls are in flight the
//! loop also refreshes the state lock on a fixed heartbeat.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{CirrusError, ProviderError, Result};
use crate::model::OutputReference;
use crate::provider::{
    Created, Outputs, Provider, ProviderContext, ProviderRegistry, ProviderRequest, ProviderResult,
    ResolvedDiff, ResourceId,
};
use crate::state::{HEARTBEAT_SECS, PendingAction, PendingOperation, StateRecord, StateSession};

use super::plan::{ChangeAction, Plan, PlannedChange};
use super::report::{ResourceResult, ResourceStatus, RunReport, RunStatus};

/// Default number of concurrent provider calls.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Executor for plans.
#[derive(Debug)]
pub struct PlanExecutor<'a> {
    registry: &'a ProviderRegistry,
    concurrency: usize,
    heartbeat: Duration,
    abort: Option<watch::Receiver<bool>>,
    hasher: ConfigHasher,
}

/// A provider call ready to run.
enum Operation {
    Create(ProviderRequest),
    Update(ResourceId, ResolvedDiff),
    Delete(ResourceId),
}

/// What a provider call returned.
enum Applied {
    Created(Created),
    Updated(Outputs),
    Deleted,
}

/// What woke the scheduler loop.
enum Event {
    Joined(Option<std::result::Result<(String, ProviderResult<Applied>), tokio::task::JoinError>>),
    Heartbeat,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            concurrency: DEFAULT_CONCURRENCY,
            heartbeat: Duration::from_secs(HEARTBEAT_SECS),
            abort: None,
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the maximum number of concurrent provider calls (at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets how often the state lock is refreshed while calls are in flight.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval.max(Duration::from_millis(1));
        self
    }

    /// Stops starting new changes once the watched value becomes `true`.
    #[must_use]
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Executes a plan, recording every outcome in the session.
    ///
    /// Provider failures are reported per resource; only state errors and
    /// internal failures make this return `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub async fn execute(&self, plan: &Plan, session: &mut StateSession<'_>) -> Result<RunReport> {
        info!(
            "Executing plan: {} changes, concurrency {}",
            plan.actionable().len(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(String, ProviderResult<Applied>)> = JoinSet::new();
        let mut in_flight: BTreeSet<String> = BTreeSet::new();

        let mut outputs: BTreeMap<String, Outputs> = BTreeMap::new();
        let mut results: BTreeMap<String, ResourceResult> = BTreeMap::new();
        let mut waiting: Vec<&PlannedChange> = Vec::new();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for change in &plan.changes {
            if change.action == ChangeAction::NoOp {
                if let Some(record) = &change.record {
                    outputs.insert(change.name.clone(), record.resolved_outputs.clone());
                }
                results.insert(change.name.clone(), result_for(change, ResourceStatus::NoOp, None));
            } else {
                waiting.push(change);
            }
        }

        let mut aborted = false;
        let mut fatal: Option<CirrusError> = None;

        loop {
            if !aborted && self.aborted() {
                warn!("Abort requested; letting {} in-flight change(s) finish", in_flight.len());
                aborted = true;
            }

            let mut still_waiting = Vec::with_capacity(waiting.len());
            for change in waiting {
                if let Some(blocker) = blocked_by(change, &results) {
                    debug!("Skipping {}: dependency '{blocker}' did not succeed", change.name);
                    let reason = format!("dependency '{blocker}' did not succeed");
                    results.insert(change.name.clone(), result_for(change, ResourceStatus::Skipped, Some(reason)));
                    continue;
                }

                if aborted || fatal.is_some() {
                    results.insert(
                        change.name.clone(),
                        result_for(change, ResourceStatus::Skipped, Some("run aborted".to_string())),
                    );
                    continue;
                }

                let ready = change.depends_on.iter().all(|dep| results.contains_key(dep));
                let permit = if ready {
                    Arc::clone(&semaphore).try_acquire_owned().ok()
                } else {
                    None
                };
                let Some(permit) = permit else {
                    still_waiting.push(change);
                    continue;
                };

                match self.start(change, &outputs, session, permit, &mut tasks).await {
                    Ok(Some(())) => {
                        in_flight.insert(change.name.clone());
                    }
                    Ok(None) => {}
                    Err(Started::Finished(status, error)) => {
                        results.insert(change.name.clone(), result_for(change, status, error));
                    }
                    Err(Started::Fatal(e)) => {
                        error!("Cannot record start of {}: {e}", change.name);
                        results.insert(
                            change.name.clone(),
                            result_for(change, ResourceStatus::Skipped, Some(e.to_string())),
                        );
                        fatal = Some(e);
                    }
                }
            }
            waiting = still_waiting;

            if tasks.is_empty() {
                if waiting.is_empty() {
                    break;
                }
                // Only reachable when the plan's dependencies point outside the plan.
                for change in waiting.drain(..) {
                    results.insert(
                        change.name.clone(),
                        result_for(change, ResourceStatus::Skipped, Some("unsatisfiable dependency".to_string())),
                    );
                }
                break;
            }

            let event = tokio::select! {
                joined = tasks.join_next() => Event::Joined(joined),
                _ = heartbeat.tick() => Event::Heartbeat,
            };

            let joined = match event {
                Event::Joined(joined) => joined,
                Event::Heartbeat => {
                    debug!("Refreshing state lock; {} change(s) in flight", in_flight.len());
                    if let Err(e) = session.heartbeat().await {
                        error!("Cannot refresh the state lock: {e}");
                        fatal.get_or_insert(e);
                    }
                    continue;
                }
            };

            match joined {
                Some(Ok((name, outcome))) => {
                    in_flight.remove(&name);
                    if let Some(change) = plan.get(&name) {
                        let (result, saved) = self.finish(change, outcome, &mut outputs, session).await;
                        results.insert(name, result);
                        if let Err(e) = saved {
                            error!("Cannot record outcome of {}: {e}", change.name);
                            fatal.get_or_insert(e);
                        }
                    }
                }
                Some(Err(join_error)) => {
                    error!("Provider task panicked: {join_error}");
                    fatal.get_or_insert(CirrusError::internal(format!("provider task failed: {join_error}")));
                }
                None => {}
            }
        }

        // A panicked task never reports, so its journal entry stays behind.
        if let Some(e) = fatal {
            return Err(e);
        }

        let resources: Vec<ResourceResult> = plan
            .changes
            .iter()
            .filter_map(|c| results.remove(&c.name))
            .collect();

        let status = if aborted && resources.iter().any(|r| r.status == ResourceStatus::Skipped) {
            RunStatus::Aborted
        } else if resources.iter().all(|r| r.status.is_success()) {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        };

        info!("Run finished: {status}");

        let sensitive = plan
            .changes
            .iter()
            .filter_map(|c| {
                let keys = c.node.as_ref().map(|n| &n.sensitive).or_else(|| c.record.as_ref().map(|r| &r.sensitive))?;
                (!keys.is_empty()).then(|| (c.name.clone(), keys.clone()))
            })
            .collect();

        Ok(RunReport {
            status,
            resources,
            exports: BTreeMap::new(),
            unresolved_exports: Vec::new(),
            fingerprint: plan.fingerprint.clone(),
            outputs,
            sensitive,
        })
    }

    /// Resolves and journals one change, then spawns its provider call.
    ///
    /// Returns `Ok(None)` when nothing needs to run and the change was
    /// already recorded as finished.
    async fn start(
        &self,
        change: &PlannedChange,
        outputs: &BTreeMap<String, Outputs>,
        session: &mut StateSession<'_>,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<(String, ProviderResult<Applied>)>,
    ) -> std::result::Result<Option<()>, Started> {
        // Deleted resources may reference outputs that are only in state now.
        let lookup = |r: &OutputReference| {
            outputs
                .get(&r.resource)
                .and_then(|o| r.lookup(o))
                .or_else(|| session.get(&r.resource).and_then(|rec| r.lookup(&rec.resolved_outputs)))
        };

        let provider = self.provider_for(change, &lookup).map_err(|e| Started::failed(&e))?;

        let (operation, journal) = match &change.action {
            ChangeAction::Create => {
                let node = change.node.as_ref().ok_or_else(|| Started::internal(change))?;
                let properties = resolve(node.properties.iter(), &lookup).map_err(|e| Started::failed(&e))?;
                let request = ProviderRequest {
                    resource_type: change.resource_type.clone(),
                    name: change.name.clone(),
                    properties,
                };
                (
                    Operation::Create(request),
                    PendingOperation::new(&change.name, PendingAction::Create, None),
                )
            }
            ChangeAction::Update(diff) => {
                let node = change.node.as_ref().ok_or_else(|| Started::internal(change))?;
                let record = change.record.as_ref().ok_or_else(|| Started::internal(change))?;
                let properties = resolve(node.properties.iter(), &lookup).map_err(|e| Started::failed(&e))?;
                let target = ResourceId::new(&change.resource_type, &change.name, &record.provider_id);
                (
                    Operation::Update(
                        target,
                        ResolvedDiff {
                            properties,
                            changed_fields: diff.fields(),
                        },
                    ),
                    PendingOperation::new(&change.name, PendingAction::Update, Some(record.provider_id.clone())),
                )
            }
            ChangeAction::Delete => {
                let record = change.record.as_ref().ok_or_else(|| Started::internal(change))?;
                if record.provider_id.is_empty() {
                    debug!("{} has no provider handle; treating as already deleted", change.name);
                    session
                        .commit_removal(&change.name)
                        .await
                        .map_err(Started::Fatal)?;
                    return Err(Started::Finished(ResourceStatus::Deleted, None));
                }
                let target = ResourceId::new(&change.resource_type, &change.name, &record.provider_id);
                (
                    Operation::Delete(target),
                    PendingOperation::new(&change.name, PendingAction::Delete, Some(record.provider_id.clone())),
                )
            }
            ChangeAction::NoOp => return Ok(None),
        };

        session.begin(journal).await.map_err(Started::Fatal)?;

        info!("{} {} ({})", change.action, change.name, provider.name());
        let name = change.name.clone();
        tasks.spawn(async move {
            let outcome = run(provider.as_ref(), operation).await;
            drop(permit);
            (name, outcome)
        });

        Ok(Some(()))
    }

    /// The registered plugin for the change's type, bound to the resource's
    /// own provider settings when it declares any.
    fn provider_for<F>(&self, change: &PlannedChange, lookup: &F) -> ProviderResult<Arc<dyn Provider>>
    where
        F: Fn(&OutputReference) -> Option<serde_json::Value>,
    {
        let provider = self.registry.resolve(&change.resource_type)?;

        let overrides = change
            .node
            .as_ref()
            .and_then(|n| n.provider.as_ref())
            .or_else(|| change.record.as_ref().and_then(|r| r.provider.as_ref()));
        let Some(overrides) = overrides else {
            return Ok(provider);
        };

        let overlay = ProviderContext::from_overrides(overrides, lookup)?;
        debug!("Binding {} to its own provider settings", change.name);
        provider.configure(&overlay)
    }

    /// Records the outcome of a provider call.
    async fn finish(
        &self,
        change: &PlannedChange,
        outcome: ProviderResult<Applied>,
        outputs: &mut BTreeMap<String, Outputs>,
        session: &mut StateSession<'_>,
    ) -> (ResourceResult, Result<()>) {
        match outcome {
            Err(e) => {
                warn!("{} {} failed: {e}", change.action, change.name);
                let saved = session.abandon(&change.name).await;
                (
                    result_for(change, ResourceStatus::Failed, Some(e.to_string())),
                    saved,
                )
            }
            Ok(Applied::Deleted) => {
                let saved = session.commit_removal(&change.name).await;
                (result_for(change, ResourceStatus::Deleted, None), saved)
            }
            Ok(Applied::Created(created)) => {
                let mut record = StateRecord::new(&change.name, &change.resource_type, &created.provider_id);
                self.fill_record(&mut record, change, created.outputs);
                outputs.insert(change.name.clone(), record.resolved_outputs.clone());

                let mut result = result_for(change, ResourceStatus::Created, None);
                result.provider_id = Some(created.provider_id);
                (result, session.commit(record).await)
            }
            Ok(Applied::Updated(new_outputs)) => {
                let Some(mut record) = change.record.clone() else {
                    return (
                        result_for(change, ResourceStatus::Failed, None),
                        Err(CirrusError::internal(format!("update of '{}' has no record", change.name))),
                    );
                };
                record.updated_at = Utc::now();
                self.fill_record(&mut record, change, new_outputs);
                outputs.insert(change.name.clone(), record.resolved_outputs.clone());

                (
                    result_for(change, ResourceStatus::Updated, None),
                    session.commit(record).await,
                )
            }
        }
    }

    fn fill_record(&self, record: &mut StateRecord, change: &PlannedChange, outputs: Outputs) {
        record.resolved_outputs = outputs;
        if let Some(node) = &change.node {
            record.last_applied_properties.clone_from(&node.properties);
            record.dependencies = node.dependency_names().into_iter().collect();
            record.properties_hash = self.hasher.hash_properties(&node.properties);
            record.sensitive.clone_from(&node.sensitive);
            record.provider.clone_from(&node.provider);
        }
    }
}

/// Why a change did not get spawned.
enum Started {
    /// The change is already terminal.
    Finished(ResourceStatus, Option<String>),
    /// The state could not be written.
    Fatal(CirrusError),
}

impl Started {
    fn failed(error: &ProviderError) -> Self {
        Self::Finished(ResourceStatus::Failed, Some(error.to_string()))
    }

    fn internal(change: &PlannedChange) -> Self {
        Self::Fatal(CirrusError::internal(format!(
            "planned {} of '{}' is missing its declaration or record",
            change.action, change.name
        )))
    }
}

async fn run(provider: &dyn Provider, operation: Operation) -> ProviderResult<Applied> {
    match operation {
        Operation::Create(request) => provider.create(&request).await.map(Applied::Created),
        Operation::Update(target, diff) => provider.update(&target, &diff).await.map(Applied::Updated),
        Operation::Delete(target) => match provider.delete(&target).await {
            Ok(()) => Ok(Applied::Deleted),
            Err(e) if e.is_not_found() => {
                debug!("{target} was already gone");
                Ok(Applied::Deleted)
            }
            Err(e) => Err(e),
        },
    }
}

/// Substitutes references through `lookup`.
fn resolve<'v, F>(
    properties: impl Iterator<Item = (&'v String, &'v crate::model::Value)>,
    lookup: &F,
) -> ProviderResult<Outputs>
where
    F: Fn(&OutputReference) -> Option<serde_json::Value>,
{
    properties
        .map(|(key, value)| Ok((key.clone(), value.resolve(lookup)?)))
        .collect()
}

/// The first dependency that ended without success, if any.
fn blocked_by<'c>(change: &'c PlannedChange, results: &BTreeMap<String, ResourceResult>) -> Option<&'c str> {
    change
        .depends_on
        .iter()
        .find(|dep| results.get(*dep).is_some_and(|r| !r.status.is_success()))
        .map(String::as_str)
}

fn result_for(change: &PlannedChange, status: ResourceStatus, error: Option<String>) -> ResourceResult {
    let provider_id = match status {
        ResourceStatus::Deleted => None,
        _ => change.record.as_ref().map(|r| r.provider_id.clone()),
    };
    ResourceResult {
        name: change.name.clone(),
        resource_type: change.resource_type.clone(),
        status,
        provider_id,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{ProviderOverrides, ResourceNode, Value};
    use crate::planner::Planner;
    use crate::provider::SimulatedProvider;
    use crate::state::{LocalStateStore, StateStore};
    use std::time::Duration;
    use tempfile::TempDir;

    fn resources() -> Vec<ResourceNode> {
        vec![
            ResourceNode::new("azure:core/ResourceGroup", "rg").with_property("location", "eastus"),
            ResourceNode::new("azure:network/VirtualNetwork", "vnet")
                .with_property("resource_group_name", Value::reference("rg", "name"))
                .with_property("address_space", Value::List(vec!["10.0.0.0/16".into()])),
            ResourceNode::new("azure:containerservice/Registry", "acr")
                .with_property("resource_group_name", Value::reference("rg", "name"))
                .with_property("sku", "basic"),
            ResourceNode::new("azure:network/Subnet", "subnet")
                .with_property("virtual_network_name", Value::reference("vnet", "name"))
                .with_property("address_prefixes", Value::List(vec!["10.0.1.0/24".into()])),
            ResourceNode::new("azure:containerservice/KubernetesCluster", "aks")
                .with_property("vnet_subnet_id", Value::reference("subnet", "id"))
                .with_property("registry", Value::reference("acr", "login_server")),
        ]
    }

    struct Harness {
        store: LocalStateStore,
        provider: Arc<SimulatedProvider>,
        registry: ProviderRegistry,
        _temp: TempDir,
    }

    impl Harness {
        fn new(provider: SimulatedProvider) -> Self {
            let temp = TempDir::new().unwrap();
            let provider = Arc::new(provider);
            let registry = ProviderRegistry::new().with("*", Arc::clone(&provider) as Arc<dyn Provider>);
            Self {
                store: LocalStateStore::with_base_dir(temp.path()),
                provider,
                registry,
                _temp: temp,
            }
        }

        async fn apply_with(&self, resources: &[ResourceNode], executor: PlanExecutor<'_>) -> RunReport {
            let graph = GraphBuilder::new().build(resources).unwrap();
            let mut session = StateSession::open(&self.store, "test", "kzhou", "dev").await.unwrap();
            let plan = Planner::new().plan(&graph, Some(session.snapshot())).unwrap();
            let report = executor.execute(&plan, &mut session).await.unwrap();
            session.close().await.unwrap();
            report
        }

        async fn apply(&self, resources: &[ResourceNode]) -> RunReport {
            self.apply_with(resources, PlanExecutor::new(&self.registry)).await
        }
    }

    #[tokio::test]
    async fn test_apply_creates_everything_and_records_outputs() {
        let harness = Harness::new(SimulatedProvider::new());

        let report = harness.apply(&resources()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.count(ResourceStatus::Created), 5);

        let state = harness.store.load().await.unwrap().unwrap();
        assert!(state.pending.is_empty());
        let subnet = state.get("subnet").unwrap();
        assert_eq!(subnet.dependencies, vec!["vnet"]);
        assert_eq!(subnet.resolved_outputs["virtual_network_name"], "vnet");
        assert_eq!(
            subnet.last_applied_properties["virtual_network_name"],
            Value::reference("vnet", "name")
        );

        let aks = state.get("aks").unwrap();
        assert_eq!(aks.resolved_outputs["vnet_subnet_id"], serde_json::json!(subnet.provider_id));
    }

    #[tokio::test]
    async fn test_reapply_is_all_no_ops() {
        let harness = Harness::new(SimulatedProvider::new());
        harness.apply(&resources()).await;
        let calls_before = harness.provider.calls().len();

        let report = harness.apply(&resources()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.count(ResourceStatus::NoOp), 5);
        assert_eq!(harness.provider.calls().len(), calls_before);
        assert_eq!(report.outputs["acr"]["sku"], "basic");
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let harness = Harness::new(SimulatedProvider::new().with_failure("subnet"));

        let report = harness.apply(&resources()).await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.status_of("subnet"), Some(ResourceStatus::Failed));
        assert_eq!(report.status_of("aks"), Some(ResourceStatus::Skipped));
        assert_eq!(report.status_of("acr"), Some(ResourceStatus::Created));
        assert_eq!(report.status_of("vnet"), Some(ResourceStatus::Created));
        assert!(report.get("aks").unwrap().error.as_deref().unwrap().contains("subnet"));
        assert!(!harness.provider.calls().contains(&"create aks".to_string()));

        let state = harness.store.load().await.unwrap().unwrap();
        assert!(state.get("subnet").is_none());
        assert!(state.get("acr").is_some());
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_update_sends_new_properties() {
        let harness = Harness::new(SimulatedProvider::new());
        harness.apply(&resources()).await;

        let mut desired = resources();
        desired[2] = desired[2].clone().with_property("sku", "standard");
        let report = harness.apply(&desired).await;

        assert_eq!(report.status_of("acr"), Some(ResourceStatus::Updated));
        assert_eq!(report.count(ResourceStatus::NoOp), 4);
        let state = harness.store.load().await.unwrap().unwrap();
        assert_eq!(state.get("acr").unwrap().resolved_outputs["sku"], "standard");
        assert_eq!(state.get("acr").unwrap().last_applied_properties["sku"], Value::string("standard"));
    }

    #[tokio::test]
    async fn test_removed_resources_are_deleted() {
        let harness = Harness::new(SimulatedProvider::new());
        harness.apply(&resources()).await;

        let report = harness.apply(&resources()[..3]).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.status_of("aks"), Some(ResourceStatus::Deleted));
        assert_eq!(report.status_of("subnet"), Some(ResourceStatus::Deleted));
        let calls = harness.provider.calls();
        let aks = calls.iter().position(|c| c == "delete aks").unwrap();
        let subnet = calls.iter().position(|c| c == "delete subnet").unwrap();
        assert!(aks < subnet);
        assert_eq!(harness.store.load().await.unwrap().unwrap().records.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_object_succeeds() {
        let harness = Harness::new(SimulatedProvider::new());
        harness.apply(&resources()[..1]).await;
        let rg = harness.store.load().await.unwrap().unwrap().get("rg").unwrap().provider_id.clone();
        harness.provider.forget(&rg);

        let report = harness.apply(&[]).await;

        assert_eq!(report.status_of("rg"), Some(ResourceStatus::Deleted));
        assert!(harness.store.load().await.unwrap().unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_independent_changes_fill_the_concurrency_limit() {
        let harness = Harness::new(SimulatedProvider::new().with_delay(Duration::from_millis(100)));
        let wide: Vec<ResourceNode> = (0..8)
            .map(|i| ResourceNode::new("azure:storage/Account", format!("storage-{i}")))
            .collect();

        let report = harness
            .apply_with(&wide, PlanExecutor::new(&harness.registry).with_concurrency(2))
            .await;

        assert_eq!(report.count(ResourceStatus::Created), 8);
        assert_eq!(harness.provider.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_dependents_start_after_dependencies_return() {
        let harness = Harness::new(SimulatedProvider::new().with_delay(Duration::from_millis(50)));

        let report = harness.apply(&resources()).await;
        assert_eq!(report.status, RunStatus::Success);

        let timeline = harness.provider.timeline();
        let at = |event: &str| timeline.iter().position(|e| e == event).unwrap();
        for (dependent, dependency) in [
            ("vnet", "rg"),
            ("acr", "rg"),
            ("subnet", "vnet"),
            ("aks", "subnet"),
            ("aks", "acr"),
        ] {
            assert!(
                at(&format!("> create {dependent}")) > at(&format!("< create {dependency}")),
                "{dependent} started before {dependency} returned: {timeline:?}"
            );
        }

        // vnet and acr only share rg, so they overlap.
        assert!(at("> create acr") < at("< create vnet"));
        assert!(at("> create vnet") < at("< create acr"));
    }

    #[tokio::test]
    async fn test_resource_provider_bound_to_cluster_output() {
        let harness = Harness::new(SimulatedProvider::new());
        let cluster = vec![
            ResourceNode::new("azure:containerservice/KubernetesCluster", "aks")
                .with_property("kube_config_raw", "apiVersion: v1\nkind: Config"),
            ResourceNode::new("kubernetes:core/v1:Namespace", "ns")
                .with_property("name", "kzhou")
                .with_provider(
                    ProviderOverrides::default()
                        .with_credential("kubeconfig", Value::reference("aks", "kube_config_raw")),
                ),
        ];

        let report = harness.apply(&cluster).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(
            harness.provider.context_of("ns").unwrap().credential("kubeconfig"),
            Some("apiVersion: v1\nkind: Config")
        );
        assert_eq!(harness.provider.context_of("aks").unwrap().credential("kubeconfig"), None);
        let state = harness.store.load().await.unwrap().unwrap();
        assert_eq!(state.get("ns").unwrap().dependencies, vec!["aks"]);
        assert!(state.get("ns").unwrap().provider.is_some());

        // Tearing down resolves the credential from recorded outputs.
        let report = harness.apply(&[]).await;
        assert_eq!(report.status_of("ns"), Some(ResourceStatus::Deleted));
        assert_eq!(report.status_of("aks"), Some(ResourceStatus::Deleted));
        let calls = harness.provider.calls();
        let ns = calls.iter().position(|c| c == "delete ns").unwrap();
        let aks = calls.iter().position(|c| c == "delete aks").unwrap();
        assert!(ns < aks);
    }

    #[tokio::test]
    async fn test_long_calls_refresh_the_lock() {
        let harness = Harness::new(SimulatedProvider::new().with_delay(Duration::from_millis(150)));
        let graph = GraphBuilder::new().build(&resources()[..1]).unwrap();

        let mut session = StateSession::open(&harness.store, "test", "kzhou", "dev").await.unwrap();
        let acquired = session.lock().expires_at;
        let plan = Planner::new().plan(&graph, Some(session.snapshot())).unwrap();
        let report = PlanExecutor::new(&harness.registry)
            .with_heartbeat(Duration::from_millis(20))
            .execute(&plan, &mut session)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert!(session.lock().expires_at > acquired);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_secret_outputs_are_masked_in_exports() {
        let harness = Harness::new(SimulatedProvider::new());
        let sql = vec![
            ResourceNode::new("azure:sql/Server", "sql")
                .with_property("version", "12.0")
                .with_secret("administrator_login_password", "hunter2"),
        ];

        let mut report = harness.apply(&sql).await;
        report.resolve_exports(&BTreeMap::from([
            ("password".to_string(), OutputReference::new("sql", "administrator_login_password")),
            ("version".to_string(), OutputReference::new("sql", "version")),
        ]));

        assert_eq!(report.exports["password"], crate::model::MASK);
        assert_eq!(report.exports["version"], "12.0");
        let state = harness.store.load().await.unwrap().unwrap();
        assert!(state.get("sql").unwrap().is_sensitive("administrator_login_password"));
    }

    #[tokio::test]
    async fn test_abort_skips_unstarted_changes() {
        let harness = Harness::new(SimulatedProvider::new());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = harness
            .apply_with(&resources(), PlanExecutor::new(&harness.registry).with_abort(rx))
            .await;

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.count(ResourceStatus::Skipped), 5);
        assert!(harness.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_provider_fails_resource() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let registry = ProviderRegistry::new().with("azure:core/*", Arc::new(SimulatedProvider::new()));

        let graph = GraphBuilder::new().build(&resources()[..3]).unwrap();
        let mut session = StateSession::open(&store, "test", "kzhou", "dev").await.unwrap();
        let plan = Planner::new().plan(&graph, None).unwrap();
        let report = PlanExecutor::new(&registry).execute(&plan, &mut session).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(report.status_of("rg"), Some(ResourceStatus::Created));
        assert_eq!(report.status_of("vnet"), Some(ResourceStatus::Failed));
        assert!(report.get("vnet").unwrap().error.as_deref().unwrap().contains("No provider"));
    }

    #[tokio::test]
    async fn test_missing_output_fails_resource() {
        let harness = Harness::new(SimulatedProvider::new());
        let desired = vec![
            ResourceNode::new("azure:core/ResourceGroup", "rg"),
            ResourceNode::new("azure:network/VirtualNetwork", "vnet")
                .with_property("dns", Value::reference("rg", "dns_servers")),
        ];

        let report = harness.apply(&desired).await;

        assert_eq!(report.status_of("vnet"), Some(ResourceStatus::Failed));
        assert!(report.get("vnet").unwrap().error.as_deref().unwrap().contains("dns_servers"));
    }
}
