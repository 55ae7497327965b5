//! Reconciler for converging infrastructure on a declaration.
//!
//! One run builds the dependency graph, opens a locked state session,
//! plans against the recorded state and applies the plan. Declaration and
//! planning errors surface before any provider is called.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConfigHasher;
use crate::error::{Result, StateError};
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::model::{Declaration, OutputReference};
use crate::planner::{DEFAULT_CONCURRENCY, Plan, PlanExecutor, Planner, RunReport, RunStatus, resolve_exports};
use crate::provider::{Outputs, Provider, ProviderContext, ProviderRegistry, ProviderResult, ResourceId};
use crate::state::{
    RunHistoryEntry, RunOperation, StateRecord, StateSession, StateSnapshot, StateStore, generate_holder_id,
};

/// Reconciler for one project environment.
pub struct Reconciler<'a> {
    /// State store.
    store: &'a dyn StateStore,
    /// Provider plugins.
    registry: &'a ProviderRegistry,
    /// Project name recorded in state.
    project: String,
    /// Environment recorded in state.
    environment: String,
    /// Lock holder identity.
    holder: String,
    /// Maximum concurrent provider calls.
    concurrency: usize,
    /// Abort signal for in-progress runs.
    abort: Option<watch::Receiver<bool>>,
    hasher: ConfigHasher,
    builder: GraphBuilder,
    planner: Planner,
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        store: &'a dyn StateStore,
        registry: &'a ProviderRegistry,
        project: &str,
        environment: &str,
    ) -> Self {
        Self {
            store,
            registry,
            project: project.to_string(),
            environment: environment.to_string(),
            holder: generate_holder_id(),
            concurrency: DEFAULT_CONCURRENCY,
            abort: None,
            hasher: ConfigHasher::new(),
            builder: GraphBuilder::new(),
            planner: Planner::new(),
        }
    }

    /// Sets the maximum number of concurrent provider calls.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Stops starting new changes once the watched value becomes `true`.
    #[must_use]
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Overrides the lock holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = holder.to_string();
        self
    }

    /// Plans a declaration against the recorded state without locking.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid, the state cannot be
    /// read, or the plan has a conflict.
    pub async fn plan(&self, declaration: &Declaration) -> Result<Plan> {
        let graph = self.builder.build(&declaration.resources)?;
        let state = self.store.load().await?;

        if let Some(state) = &state
            && state.has_pending()
        {
            warn!(
                "State has unfinished operations on: {}",
                state.pending_resources().join(", ")
            );
        }

        self.planner.plan(&graph, state.as_ref())
    }

    /// Converges infrastructure on a declaration.
    ///
    /// Provider failures do not make this fail; they are reported per
    /// resource in the returned report.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid, the state is locked
    /// or holds unfinished operations, the plan has a conflict, or state
    /// cannot be written.
    pub async fn apply(&self, declaration: &Declaration) -> Result<RunReport> {
        info!(
            "Applying {} resource(s) to {}/{}",
            declaration.resources.len(),
            self.project,
            self.environment
        );

        let graph = self.builder.build(&declaration.resources)?;
        let fingerprint = self.hasher.hash_declaration(declaration);
        let mut report = self.run(&graph, RunOperation::Apply, &fingerprint).await?;
        report.resolve_exports(&declaration.exports);

        if !report.unresolved_exports.is_empty() {
            warn!("Unresolved exports: {}", report.unresolved_exports.join(", "));
        }

        Ok(report)
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is locked or holds unfinished
    /// operations, or cannot be written.
    pub async fn destroy(&self) -> Result<RunReport> {
        info!("Destroying {}/{}", self.project, self.environment);

        let graph = DependencyGraph::new();
        let fingerprint = self.hasher.hash_declaration(&Declaration::default());
        self.run(&graph, RunOperation::Destroy, &fingerprint).await
    }

    /// Plans and executes within one locked session.
    async fn run(&self, graph: &DependencyGraph, operation: RunOperation, fingerprint: &str) -> Result<RunReport> {
        let mut session =
            StateSession::open(self.store, &self.holder, &self.project, &self.environment).await?;

        let pending = session.snapshot().pending_resources();
        if !pending.is_empty() {
            session.close().await?;
            return Err(StateError::InterruptedRun { resources: pending }.into());
        }

        let plan = match self.planner.plan(graph, Some(session.snapshot())) {
            Ok(plan) => plan,
            Err(e) => {
                session.close().await?;
                return Err(e);
            }
        };

        if !plan.has_changes() {
            info!("No changes required; state is converged");
        }

        let mut executor = PlanExecutor::new(self.registry).with_concurrency(self.concurrency);
        if let Some(abort) = &self.abort {
            executor = executor.with_abort(abort.clone());
        }

        let mut report = match executor.execute(&plan, &mut session).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    warn!("Failed to release state lock: {close_error}");
                }
                return Err(e);
            }
        };
        report.fingerprint = fingerprint.to_string();

        if plan.has_changes() {
            let entry = match report.status {
                RunStatus::Success => RunHistoryEntry::new(operation, fingerprint, report.changed()),
                status => {
                    let failed: Vec<String> = report
                        .resources
                        .iter()
                        .filter(|r| !r.status.is_success())
                        .map(|r| format!("{} {}", r.name, r.status))
                        .collect();
                    RunHistoryEntry::failed(
                        operation,
                        fingerprint,
                        report.changed(),
                        &format!("{status}: {}", failed.join(", ")),
                    )
                }
            };
            session.record_history(entry).await?;
        }

        session.close().await?;
        Ok(report)
    }

    /// Drops unfinished operation entries after the operator checked them.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is locked or cannot be written.
    pub async fn clear_pending(&self) -> Result<Vec<String>> {
        let mut session =
            StateSession::open(self.store, &self.holder, &self.project, &self.environment).await?;
        let cleared = match session.clear_pending().await {
            Ok(cleared) => cleared,
            Err(e) => {
                session.close().await?;
                return Err(e);
            }
        };
        session.close().await?;

        if !cleared.is_empty() {
            info!("Cleared pending operations on: {}", cleared.join(", "));
        }
        Ok(cleared)
    }

    /// Resolves exports from the recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub async fn outputs(&self, declaration: &Declaration) -> Result<ExportReport> {
        let records = self.store.load().await?.map(|state| state.records).unwrap_or_default();

        let mut outputs: BTreeMap<String, Outputs> = BTreeMap::new();
        let mut sensitive: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, record) in records {
            sensitive.insert(name.clone(), record.sensitive);
            outputs.insert(name, record.resolved_outputs);
        }

        let (exports, unresolved) = resolve_exports(&outputs, &declaration.exports, &sensitive);
        Ok(ExportReport { exports, unresolved })
    }

    /// Compares recorded outputs and the declaration with what providers
    /// report now.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid, the state cannot be
    /// read, or the plan has a conflict.
    pub async fn check_drift(&self, declaration: &Declaration) -> Result<DriftReport> {
        info!("Checking for drift in {}/{}", self.project, self.environment);

        let graph = self.builder.build(&declaration.resources)?;
        let state = self
            .store
            .load()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(&self.project, &self.environment));
        let plan = self.planner.plan(&graph, Some(&state))?;

        let mut resources = Vec::with_capacity(state.records.len());
        for record in state.records.values() {
            let status = match self.provider_for(record, &state) {
                Err(e) => DriftStatus::Unreadable { error: e.to_string() },
                Ok(provider) => {
                    let target = ResourceId::new(&record.resource_type, &record.name, &record.provider_id);
                    match provider.read(&target).await {
                        Ok(live) => compare_outputs(&record.resolved_outputs, &live),
                        Err(e) if e.is_not_found() => DriftStatus::Missing,
                        Err(e) => DriftStatus::Unreadable { error: e.to_string() },
                    }
                }
            };
            debug!("{}: {status}", record.name);
            resources.push(DriftEntry {
                name: record.name.clone(),
                resource_type: record.resource_type.clone(),
                status,
            });
        }

        let pending_changes = plan.actionable().iter().map(|c| c.name.clone()).collect();

        Ok(DriftReport {
            resources,
            pending_changes,
        })
    }
}

impl Reconciler<'_> {
    /// The plugin for a recorded resource, bound to its recorded provider
    /// settings resolved against recorded outputs.
    fn provider_for(&self, record: &StateRecord, state: &StateSnapshot) -> ProviderResult<Arc<dyn Provider>> {
        let provider = self.registry.resolve(&record.resource_type)?;
        let Some(overrides) = &record.provider else {
            return Ok(provider);
        };

        let lookup = |r: &OutputReference| {
            state
                .get(&r.resource)
                .and_then(|rec| r.lookup(&rec.resolved_outputs))
        };
        provider.configure(&ProviderContext::from_overrides(overrides, &lookup)?)
    }
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backend", &self.store.backend_type())
            .field("project", &self.project)
            .field("environment", &self.environment)
            .field("holder", &self.holder)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

fn compare_outputs(recorded: &Outputs, live: &Outputs) -> DriftStatus {
    let mut fields: Vec<String> = recorded
        .iter()
        .filter(|(key, value)| live.get(key.as_str()) != Some(value))
        .map(|(key, _)| key.clone())
        .chain(live.keys().filter(|key| !recorded.contains_key(key.as_str())).cloned())
        .collect();
    fields.sort();

    if fields.is_empty() {
        DriftStatus::InSync
    } else {
        DriftStatus::Drifted { fields }
    }
}

/// Exports resolved from recorded state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ExportReport {
    /// Resolved export values.
    pub exports: BTreeMap<String, serde_json::Value>,
    /// Exports whose source is not recorded.
    pub unresolved: Vec<String>,
}

/// How one recorded resource compares with its provider.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Provider outputs match the record.
    InSync,
    /// Provider outputs differ from the record.
    Drifted {
        /// Output fields that differ, sorted.
        fields: Vec<String>,
    },
    /// The provider no longer knows the resource.
    Missing,
    /// The provider could not be asked.
    Unreadable {
        /// Why the read failed.
        error: String,
    },
}

/// Drift of one recorded resource.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DriftEntry {
    /// Logical name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Comparison result.
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Report of drift detection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DriftReport {
    /// Per-resource comparison, sorted by name.
    pub resources: Vec<DriftEntry>,
    /// Resources the declaration would change.
    pub pending_changes: Vec<String>,
}

impl DriftReport {
    /// Names of resources that drifted, went missing or could not be read.
    #[must_use]
    pub fn drifted(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.status != DriftStatus::InSync)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Returns true if providers match the records and the declaration
    /// needs no changes.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.pending_changes.is_empty() && self.drifted().is_empty()
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in sync"),
            Self::Drifted { fields } => write!(f, "drifted ({})", fields.join(", ")),
            Self::Missing => write!(f, "missing"),
            Self::Unreadable { error } => write!(f, "unreadable: {error}"),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected; state is converged");
        }

        let drifted: Vec<&DriftEntry> = self
            .resources
            .iter()
            .filter(|r| r.status != DriftStatus::InSync)
            .collect();
        if !drifted.is_empty() {
            writeln!(f, "Drift detected:")?;
            for entry in drifted {
                writeln!(f, "  - {}: {}", entry.name, entry.status)?;
            }
        }
        if !self.pending_changes.is_empty() {
            writeln!(f, "Declaration changes pending:")?;
            for name in &self.pending_changes {
                writeln!(f, "  - {name}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CirrusError, PlanError};
    use crate::model::{OutputReference, ResourceNode, Value};
    use crate::planner::ResourceStatus;
    use crate::provider::{Provider, SimulatedProvider};
    use crate::state::{LocalStateStore, PendingAction, PendingOperation};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn declaration() -> Declaration {
        Declaration::new(vec![
            ResourceNode::new("azure:core/ResourceGroup", "rg").with_property("location", "eastus"),
            ResourceNode::new("azure:containerservice/Registry", "acr")
                .with_property("resource_group_name", Value::reference("rg", "name"))
                .with_property("sku", "basic"),
            ResourceNode::new("azure:network/VirtualNetwork", "vnet")
                .with_property("resource_group_name", Value::reference("rg", "name")),
        ])
        .with_export("registry_id", OutputReference::new("acr", "id"))
    }

    struct Fixture {
        store: LocalStateStore,
        provider: Arc<SimulatedProvider>,
        registry: ProviderRegistry,
        _temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let provider = Arc::new(SimulatedProvider::new());
            let registry = ProviderRegistry::new().with("*", Arc::clone(&provider) as Arc<dyn Provider>);
            Self {
                store: LocalStateStore::with_base_dir(temp.path()),
                provider,
                registry,
                _temp: temp,
            }
        }

        fn reconciler(&self) -> Reconciler<'_> {
            Reconciler::new(&self.store, &self.registry, "kzhou", "dev")
        }
    }

    #[tokio::test]
    async fn test_apply_then_plan_converges() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();

        let report = reconciler.apply(&declaration()).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert!(report.exports["registry_id"].as_str().unwrap().starts_with("registry-acr-"));

        let plan = reconciler.plan(&declaration()).await.unwrap();
        assert!(!plan.has_changes());

        let state = fixture.store.load().await.unwrap().unwrap();
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);
        assert!(!fixture.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_converged_apply_records_no_history() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();
        reconciler.apply(&declaration()).await.unwrap();

        let report = reconciler.apply(&declaration()).await.unwrap();

        assert!(report.changed().is_empty());
        assert_eq!(fixture.store.load().await.unwrap().unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_recorded() {
        let fixture = Fixture::new();
        fixture.provider.fail("acr");

        let report = fixture.reconciler().apply(&declaration()).await.unwrap();

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.unresolved_exports, vec!["registry_id"]);
        let state = fixture.store.load().await.unwrap().unwrap();
        assert!(!state.history[0].success);
        assert!(state.history[0].error.as_deref().unwrap().contains("acr failed"));
    }

    #[tokio::test]
    async fn test_conflict_applies_nothing_and_releases_lock() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();
        reconciler.apply(&declaration()).await.unwrap();
        let calls = fixture.provider.calls().len();

        let mut renamed = declaration();
        renamed.resources[1].resource_type = "azure:containerservice/Cache".to_string();
        let err = reconciler.apply(&renamed).await.unwrap_err();

        assert!(matches!(err, CirrusError::Plan(PlanError::Conflict { .. })));
        assert_eq!(fixture.provider.calls().len(), calls);
        assert!(!fixture.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_blocks_apply() {
        let fixture = Fixture::new();
        fixture.store.acquire_lock("other-host").await.unwrap();

        let err = fixture.reconciler().apply(&declaration()).await.unwrap_err();

        assert!(matches!(err, CirrusError::State(StateError::LockConflict { .. })));
        assert!(fixture.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_run_is_surfaced_then_cleared() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();
        {
            let mut session = StateSession::open(&fixture.store, "crashed", "kzhou", "dev").await.unwrap();
            session
                .begin(PendingOperation::new("rg", PendingAction::Create, None))
                .await
                .unwrap();
            session.close().await.unwrap();
        }

        let err = reconciler.apply(&declaration()).await.unwrap_err();
        match err {
            CirrusError::State(StateError::InterruptedRun { resources }) => assert_eq!(resources, vec!["rg"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(fixture.provider.calls().is_empty());

        assert_eq!(reconciler.clear_pending().await.unwrap(), vec!["rg"]);
        assert!(reconciler.apply(&declaration()).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();
        reconciler.apply(&declaration()).await.unwrap();

        let report = reconciler.destroy().await.unwrap();

        assert_eq!(report.count(ResourceStatus::Deleted), 3);
        assert_eq!(report.resources.last().unwrap().name, "rg");
        assert_eq!(fixture.provider.object_count(), 0);
        let state = fixture.store.load().await.unwrap().unwrap();
        assert!(state.records.is_empty());
        assert_eq!(state.history.last().unwrap().operation, RunOperation::Destroy);
    }

    #[tokio::test]
    async fn test_outputs_read_from_state() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();
        reconciler.apply(&declaration()).await.unwrap();

        let outputs = reconciler.outputs(&declaration()).await.unwrap();

        assert!(outputs.unresolved.is_empty());
        assert!(outputs.exports.contains_key("registry_id"));
    }

    #[tokio::test]
    async fn test_drift_detection() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler();
        reconciler.apply(&declaration()).await.unwrap();
        assert!(reconciler.check_drift(&declaration()).await.unwrap().is_converged());

        let state = fixture.store.load().await.unwrap().unwrap();
        fixture
            .provider
            .set_output(&state.get("acr").unwrap().provider_id, "sku", serde_json::json!("premium"));
        fixture.provider.forget(&state.get("vnet").unwrap().provider_id);

        let report = reconciler.check_drift(&declaration()).await.unwrap();

        assert_eq!(report.drifted(), vec!["acr", "vnet"]);
        assert_eq!(report.resources[0].status, DriftStatus::Drifted { fields: vec!["sku".to_string()] });
        assert_eq!(report.resources[2].status, DriftStatus::Missing);
        assert!(report.pending_changes.is_empty());
    }
}
