//! Plans and the planner that builds them.
//!
//! A plan is one ordered change per resource, either declared or recorded.
//! Ordering comes from a single topological sort over a combined action
//! graph:
//!
//! - declared dependencies run before their dependents;
//! - a removed resource is deleted before the removed resources it
//!   depended on, so deletes run in reverse creation order;
//! - a surviving resource that is updated away from a removed resource is
//!   updated before that resource is deleted.
//!
//! Ties go to deletes first, then to the smaller name.

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

use crate::config::ConfigHasher;
use crate::error::{PlanError, Result};
use crate::graph::DependencyGraph;
use crate::model::ResourceNode;
use crate::state::{StateRecord, StateSnapshot};

use super::diff::PropertyDiff;

/// What happens to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "diff", rename_all = "snake_case")]
pub enum ChangeAction {
    /// Not yet applied.
    Create,
    /// Applied with different properties.
    Update(PropertyDiff),
    /// Applied but no longer declared.
    Delete,
    /// Applied and unchanged.
    NoOp,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    /// Logical resource name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// What to do.
    #[serde(flatten)]
    pub action: ChangeAction,
    /// Desired declaration; absent for deletes. Serialized with secrets masked.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "redacted_node")]
    pub node: Option<ResourceNode>,
    /// Last applied record; absent for creates. Serialized with secrets masked.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "redacted_record")]
    pub record: Option<StateRecord>,
    /// Changes that must complete before this one starts, sorted.
    pub depends_on: Vec<String>,
}

#[allow(clippy::ref_option)]
fn redacted_node<S: Serializer>(node: &Option<ResourceNode>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    node.as_ref().map(ResourceNode::redacted).serialize(serializer)
}

#[allow(clippy::ref_option)]
fn redacted_record<S: Serializer>(record: &Option<StateRecord>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    record.as_ref().map(StateRecord::redacted).serialize(serializer)
}

/// An ordered change list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Changes in apply order.
    pub changes: Vec<PlannedChange>,
    /// Fingerprint of the declared resources.
    pub fingerprint: String,
}

/// Diffs a dependency graph against recorded state.
#[derive(Debug, Default)]
pub struct Planner {
    hasher: ConfigHasher,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Builds the plan.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Conflict`] when a delete cannot be sequenced
    /// safely against what survives, when a name changes resource type, or
    /// when the recorded dependencies of removed resources form a cycle.
    pub fn plan(&self, graph: &DependencyGraph, state: Option<&StateSnapshot>) -> Result<Plan> {
        let empty = BTreeMap::new();
        let records = state.map_or(&empty, |s| &s.records);

        let mut changes: BTreeMap<String, PlannedChange> = BTreeMap::new();

        for node in graph.nodes() {
            let record = records.get(&node.name);
            let action = match record {
                None => ChangeAction::Create,
                Some(record) if record.resource_type != node.resource_type => {
                    return Err(PlanError::conflict(
                        &node.name,
                        format!(
                            "type changed from '{}' to '{}'; rename the resource or remove it first",
                            record.resource_type, node.resource_type
                        ),
                    )
                    .into());
                }
                Some(record) => {
                    let sensitive: BTreeSet<String> = node.sensitive.union(&record.sensitive).cloned().collect();
                    let diff = PropertyDiff::between(&record.last_applied_properties, &node.properties, &sensitive);
                    if diff.is_empty() {
                        ChangeAction::NoOp
                    } else {
                        ChangeAction::Update(diff)
                    }
                }
            };

            changes.insert(
                node.name.clone(),
                PlannedChange {
                    name: node.name.clone(),
                    resource_type: node.resource_type.clone(),
                    action,
                    node: Some(node.clone()),
                    record: record.cloned(),
                    depends_on: Vec::new(),
                },
            );
        }

        for (name, record) in records {
            if !graph.contains(name) {
                changes.insert(
                    name.clone(),
                    PlannedChange {
                        name: name.clone(),
                        resource_type: record.resource_type.clone(),
                        action: ChangeAction::Delete,
                        node: None,
                        record: Some(record.clone()),
                        depends_on: Vec::new(),
                    },
                );
            }
        }

        let before = ordering_edges(graph, &changes)?;
        let order = sort(&changes, &before)?;

        let mut ordered = Vec::with_capacity(order.len());
        for name in order {
            if let Some(mut change) = changes.remove(&name) {
                change.depends_on = before
                    .get(&name)
                    .map(|deps| deps.iter().cloned().collect())
                    .unwrap_or_default();
                ordered.push(change);
            }
        }

        let plan = Plan {
            changes: ordered,
            fingerprint: self.hasher.hash_resources(graph.nodes()),
        };

        info!(
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            plan.create_count(),
            plan.update_count(),
            plan.delete_count(),
            plan.unchanged_count()
        );

        Ok(plan)
    }
}

/// For every change, the changes that must finish first.
fn ordering_edges(
    graph: &DependencyGraph,
    changes: &BTreeMap<String, PlannedChange>,
) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut before: BTreeMap<String, BTreeSet<String>> =
        changes.keys().map(|name| (name.clone(), BTreeSet::new())).collect();

    for name in graph.names() {
        if let Some(deps) = before.get_mut(name) {
            deps.extend(graph.dependencies(name));
        }
    }

    let deleted: Vec<&PlannedChange> = changes
        .values()
        .filter(|c| c.action == ChangeAction::Delete)
        .collect();

    for removed in deleted {
        let Some(record) = &removed.record else {
            continue;
        };

        for dependency in &record.dependencies {
            if changes.get(dependency).is_some_and(|c| c.action == ChangeAction::Delete)
                && let Some(deps) = before.get_mut(dependency)
            {
                deps.insert(removed.name.clone());
            }
        }

        for survivor in changes.values().filter(|c| c.action != ChangeAction::Delete) {
            let was_dependent = survivor
                .record
                .as_ref()
                .is_some_and(|r| r.dependencies.contains(&removed.name));
            if !was_dependent {
                continue;
            }

            match survivor.action {
                ChangeAction::NoOp => {
                    return Err(PlanError::conflict(
                        &removed.name,
                        format!(
                            "'{}' was applied depending on it and is unchanged, so deleting it would leave '{}' dangling",
                            survivor.name, survivor.name
                        ),
                    )
                    .into());
                }
                _ => {
                    if let Some(deps) = before.get_mut(&removed.name) {
                        deps.insert(survivor.name.clone());
                    }
                }
            }
        }
    }

    Ok(before)
}

/// Kahn's algorithm with a `(delete first, name)` tie-break.
fn sort(
    changes: &BTreeMap<String, PlannedChange>,
    before: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let rank = |name: &str| -> (u8, String) {
        let is_delete = changes.get(name).is_some_and(|c| c.action == ChangeAction::Delete);
        (u8::from(!is_delete), name.to_string())
    };

    let mut after: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
    for (name, deps) in before {
        remaining.insert(name.as_str(), deps.len());
        for dep in deps {
            after.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: BTreeSet<(u8, String)> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| rank(name))
        .collect();

    let mut order = Vec::with_capacity(before.len());

    while let Some((_, name)) = ready.pop_first() {
        remaining.remove(name.as_str());
        for next in after.get(name.as_str()).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(rank(next));
                }
            }
        }
        order.push(name);
    }

    if let Some((stuck, _)) = remaining.first_key_value() {
        let cycle: Vec<&str> = remaining.keys().copied().collect();
        debug!("Unorderable changes: {cycle:?}");
        return Err(PlanError::conflict(
            *stuck,
            format!(
                "recorded dependencies of removed resources form a cycle: {}",
                cycle.join(", ")
            ),
        )
        .into());
    }

    Ok(order)
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn empty(fingerprint: &str) -> Self {
        Self {
            changes: Vec::new(),
            fingerprint: fingerprint.to_string(),
        }
    }

    /// Returns the change for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.name == name)
    }

    /// Returns true if any change is not a no-op.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != ChangeAction::NoOp)
    }

    /// Changes that call a provider.
    #[must_use]
    pub fn actionable(&self) -> Vec<&PlannedChange> {
        self.changes
            .iter()
            .filter(|c| c.action != ChangeAction::NoOp)
            .collect()
    }

    /// Number of creates.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(|a| matches!(a, ChangeAction::Create))
    }

    /// Number of updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(|a| matches!(a, ChangeAction::Update(_)))
    }

    /// Number of deletes.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(|a| matches!(a, ChangeAction::Delete))
    }

    /// Number of unchanged resources.
    #[must_use]
    pub fn unchanged_count(&self) -> usize {
        self.count(|a| matches!(a, ChangeAction::NoOp))
    }

    fn count(&self, predicate: impl Fn(&ChangeAction) -> bool) -> usize {
        self.changes.iter().filter(|c| predicate(&c.action)).count()
    }
}

impl ChangeAction {
    /// Plan-line marker.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update(_) => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update(_) => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.action.symbol(),
            self.name,
            self.resource_type
        )?;
        if let ChangeAction::Update(diff) = &self.action {
            write!(f, " {diff}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes. Infrastructure matches the declaration.");
        }

        for change in &self.changes {
            writeln!(f, "{change}")?;
        }

        write!(
            f,
            "\nPlan: {} to create, {} to update, {} to delete.",
            self.create_count(),
            self.update_count(),
            self.delete_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, Settings};
    use crate::error::{CirrusError, GraphError};
    use crate::graph::GraphBuilder;
    use crate::model::{MASK, Value};

    fn scenario_a() -> Vec<ResourceNode> {
        vec![
            ResourceNode::new("azure:core/ResourceGroup", "rg").with_property("location", "eastus"),
            ResourceNode::new("azure:network/VirtualNetwork", "vnet")
                .with_property("resource_group_name", Value::reference("rg", "name")),
            ResourceNode::new("azure:containerservice/Registry", "acr")
                .with_property("resource_group_name", Value::reference("rg", "name"))
                .with_property("sku", "basic"),
            ResourceNode::new("azure:network/Subnet", "subnet")
                .with_property("virtual_network_name", Value::reference("vnet", "name"))
                .depends_on("acr"),
            ResourceNode::new("azure:containerservice/KubernetesCluster", "aks")
                .with_property("vnet_subnet_id", Value::reference("subnet", "id")),
        ]
    }

    /// State as if `resources` had been applied successfully.
    fn applied(resources: &[ResourceNode]) -> StateSnapshot {
        let graph = GraphBuilder::new().build(resources).unwrap();
        let mut state = StateSnapshot::new("kzhou", "dev");
        for node in resources {
            let mut record = StateRecord::new(&node.name, &node.resource_type, &format!("{}-1", node.name));
            record.last_applied_properties = node.properties.clone();
            record.dependencies = graph.dependencies(&node.name).into_iter().collect();
            state.upsert(record);
        }
        state
    }

    fn plan(resources: &[ResourceNode], state: Option<&StateSnapshot>) -> Result<Plan> {
        let graph = GraphBuilder::new().build(resources)?;
        Planner::new().plan(&graph, state)
    }

    fn names(plan: &Plan) -> Vec<&str> {
        plan.changes.iter().map(|c| c.name.as_str()).collect()
    }

    fn position(plan: &Plan, name: &str) -> usize {
        plan.changes.iter().position(|c| c.name == name).unwrap()
    }

    #[test]
    fn test_fresh_graph_is_all_creates_in_dependency_order() {
        let plan = plan(&scenario_a(), None).unwrap();

        assert_eq!(names(&plan), vec!["rg", "acr", "vnet", "subnet", "aks"]);
        assert!(plan.changes.iter().all(|c| c.action == ChangeAction::Create));
        assert_eq!(plan.get("subnet").unwrap().depends_on, vec!["acr", "vnet"]);
        assert_eq!(plan.get("aks").unwrap().depends_on, vec!["subnet"]);
        assert!(plan.get("rg").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_single_property_change_is_one_update() {
        let state = applied(&scenario_a());
        let mut desired = scenario_a();
        desired[2] = desired[2].clone().with_property("sku", "standard");

        let plan = plan(&desired, Some(&state)).unwrap();

        let updates = plan.actionable();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "acr");
        match &updates[0].action {
            ChangeAction::Update(diff) => assert_eq!(diff.to_string(), "{sku: basic -> standard}"),
            other => panic!("expected update, got {other}"),
        }
        assert_eq!(plan.unchanged_count(), 4);
    }

    #[test]
    fn test_removed_dependency_of_unchanged_resource_conflicts() {
        let state = applied(&scenario_a());
        let desired: Vec<ResourceNode> = scenario_a()
            .into_iter()
            .filter(|n| n.name != "acr")
            .map(|n| {
                if n.name == "subnet" {
                    ResourceNode {
                        explicit_deps: BTreeSet::new(),
                        ..n
                    }
                } else {
                    n
                }
            })
            .collect();

        // subnet's declaration dropped acr, but the explicit dependency is not a
        // property, so subnet is unchanged and nothing would detach it first.
        let err = plan(&desired, Some(&state)).unwrap_err();
        assert!(matches!(
            err,
            CirrusError::Plan(PlanError::Conflict { ref resource, .. }) if resource == "acr"
        ));
    }

    #[test]
    fn test_removed_resource_still_named_in_depends_on_is_unknown() {
        let state = applied(&scenario_a());
        let desired: Vec<ResourceNode> = scenario_a().into_iter().filter(|n| n.name != "acr").collect();

        // subnet keeps `depends_on: acr`; the declaration is rejected before planning.
        let err = plan(&desired, Some(&state)).unwrap_err();
        assert!(matches!(
            err,
            CirrusError::Graph(GraphError::UnknownReference { ref from, ref target })
                if from == "subnet" && target == "acr"
        ));
    }

    #[test]
    fn test_secret_settings_never_reach_plan_output() {
        let yaml = r#"
project:
  name: kzhou
settings:
  sa_password:
    value: hunter2-SECRET
    secret: true
resources:
  - type: azure:sql/Server
    name: sql
    properties:
      version: "12.0"
      administrator_login_password: ${settings.sa_password}
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let settings = Settings::resolve(&config.settings, |_| None).unwrap();
        let declaration = config.declaration(&settings).unwrap();

        let created = plan(&declaration.resources, None).unwrap();
        let text = created.to_string();
        let json = serde_json::to_string(&created).unwrap();
        assert!(!text.contains("hunter2-SECRET"));
        assert!(!json.contains("hunter2-SECRET"));
        assert!(json.contains(MASK));

        let mut state = applied(&declaration.resources);
        let mut record = state.get("sql").unwrap().clone();
        record
            .last_applied_properties
            .insert("administrator_login_password".into(), Value::string("old-SECRET"));
        record.sensitive.insert("administrator_login_password".into());
        state.upsert(record);

        let updated = plan(&declaration.resources, Some(&state)).unwrap();
        assert_eq!(updated.update_count(), 1);
        let text = updated.to_string();
        let json = serde_json::to_string(&updated).unwrap();
        for secret in ["hunter2-SECRET", "old-SECRET"] {
            assert!(!text.contains(secret), "{text}");
            assert!(!json.contains(secret), "{json}");
        }
        assert!(text.contains("administrator_login_password: (sensitive)"));
    }

    #[test]
    fn test_updated_dependent_runs_before_delete() {
        let mut resources = scenario_a();
        resources[3] = resources[3]
            .clone()
            .with_property("registry", Value::reference("acr", "id"));
        let state = applied(&resources);

        let mut desired = scenario_a();
        desired.retain(|n| n.name != "acr");
        desired[2].explicit_deps.clear();

        let plan = plan(&desired, Some(&state)).unwrap();

        assert_eq!(plan.get("acr").unwrap().action, ChangeAction::Delete);
        assert!(matches!(plan.get("subnet").unwrap().action, ChangeAction::Update(_)));
        assert!(position(&plan, "subnet") < position(&plan, "acr"));
        assert_eq!(plan.get("acr").unwrap().depends_on, vec!["subnet"]);
    }

    #[test]
    fn test_deletes_run_in_reverse_creation_order() {
        let state = applied(&scenario_a());

        let plan = plan(&[], Some(&state)).unwrap();

        assert_eq!(plan.delete_count(), 5);
        assert_eq!(names(&plan), vec!["aks", "subnet", "acr", "vnet", "rg"]);
        assert_eq!(plan.get("rg").unwrap().depends_on, vec!["acr", "vnet"]);
    }

    #[test]
    fn test_deletes_go_first_among_ready_changes() {
        let mut state = applied(&scenario_a()[..1]);
        state.upsert(StateRecord::new("old-storage", "azure:storage/Account", "storage-1"));
        let desired = vec![
            scenario_a()[0].clone(),
            ResourceNode::new("azure:storage/Account", "a-new-storage"),
        ];

        let plan = plan(&desired, Some(&state)).unwrap();
        assert_eq!(names(&plan), vec!["old-storage", "a-new-storage", "rg"]);
    }

    #[test]
    fn test_type_change_conflicts() {
        let state = applied(&scenario_a()[..1]);
        let desired = vec![ResourceNode::new("azure:core/ResourceGroupV2", "rg")];

        let err = plan(&desired, Some(&state)).unwrap_err();
        assert!(matches!(err, CirrusError::Plan(PlanError::Conflict { .. })));
    }

    #[test]
    fn test_cycle_among_removed_records_conflicts() {
        let mut state = StateSnapshot::new("kzhou", "dev");
        let mut a = StateRecord::new("a", "t", "a-1");
        a.dependencies = vec!["b".into()];
        let mut b = StateRecord::new("b", "t", "b-1");
        b.dependencies = vec!["a".into()];
        state.upsert(a);
        state.upsert(b);

        let err = plan(&[], Some(&state)).unwrap_err();
        assert!(matches!(err, CirrusError::Plan(PlanError::Conflict { .. })));
    }

    #[test]
    fn test_planning_is_deterministic() {
        let state = applied(&scenario_a()[..3]);

        let first = plan(&scenario_a(), Some(&state)).unwrap();
        let second = plan(&scenario_a(), Some(&state)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_applied_graph_replans_to_no_ops() {
        let state = applied(&scenario_a());

        let plan = plan(&scenario_a(), Some(&state)).unwrap();

        assert!(!plan.has_changes());
        assert_eq!(plan.unchanged_count(), 5);
        assert_eq!(
            plan.to_string(),
            "No changes. Infrastructure matches the declaration."
        );
    }

    #[test]
    fn test_display() {
        let plan = plan(&scenario_a()[..1], None).unwrap();
        assert_eq!(
            plan.to_string(),
            "+ rg (azure:core/ResourceGroup)\n\nPlan: 1 to create, 0 to update, 0 to delete."
        );
    }
}
