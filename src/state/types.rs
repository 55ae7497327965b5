//! State types for tracking applied resources.
//!
//! These types are the durable record of what was applied: one
//! [`StateRecord`] per logical resource, the write-ahead journal of
//! in-flight provider calls, and a short run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::model::{ProviderOverrides, Value, redact_properties};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of retained history entries.
const MAX_HISTORY: usize = 50;

/// The complete persisted state of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Identity of this state, fixed when it is first created.
    pub lineage: String,
    /// Incremented on every save.
    pub serial: u64,
    /// Applied resources keyed by logical name.
    #[serde(default)]
    pub records: BTreeMap<String, StateRecord>,
    /// Provider calls that started but whose outcome was never recorded.
    #[serde(default)]
    pub pending: Vec<PendingOperation>,
    /// When the state was last saved.
    pub last_updated: DateTime<Utc>,
    /// Recent run history.
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// What was last applied for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Logical name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Opaque handle returned by the provider on create.
    pub provider_id: String,
    /// Outputs reported by the provider after the last apply.
    #[serde(default)]
    pub resolved_outputs: serde_json::Map<String, serde_json::Value>,
    /// Properties as declared when last applied, references unresolved.
    #[serde(default)]
    pub last_applied_properties: BTreeMap<String, Value>,
    /// Dependencies at apply time, sorted.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Fingerprint of `last_applied_properties`.
    pub properties_hash: String,
    /// Property and output keys holding secrets.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sensitive: BTreeSet<String>,
    /// Per-resource provider settings at apply time, references unresolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderOverrides>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last created or updated.
    pub updated_at: DateTime<Utc>,
}

/// A provider call recorded before it is made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Logical resource name.
    pub resource: String,
    /// Operation in flight.
    pub action: PendingAction,
    /// Provider handle, when the resource already existed.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
}

/// Kinds of journaled provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    /// Create call.
    Create,
    /// Update call.
    Update,
    /// Delete call.
    Delete,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Declaration fingerprint the run applied.
    pub fingerprint: String,
    /// Resources that were changed.
    pub resources: Vec<String>,
    /// Whether every change succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Reconcile towards a declaration.
    Apply,
    /// Tear everything down.
    Destroy,
}

impl StateSnapshot {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            records: BTreeMap::new(),
            pending: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StateRecord> {
        self.records.get(name)
    }

    /// Adds or replaces a record.
    pub fn upsert(&mut self, record: StateRecord) {
        self.records.insert(record.name.clone(), record);
    }

    /// Removes a record by name.
    pub fn remove(&mut self, name: &str) -> Option<StateRecord> {
        self.records.remove(name)
    }

    /// Journals a provider call, replacing any older entry for the same resource.
    pub fn begin(&mut self, operation: PendingOperation) {
        self.pending.retain(|p| p.resource != operation.resource);
        self.pending.push(operation);
    }

    /// Clears the journal entry for a resource.
    pub fn finish(&mut self, resource: &str) {
        self.pending.retain(|p| p.resource != resource);
    }

    /// Returns true if a previous run left unrecorded provider calls.
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Names of resources with unrecorded provider calls, sorted.
    #[must_use]
    pub fn pending_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.iter().map(|p| p.resource.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all record names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    /// A copy safe to display, every record redacted.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            records: self
                .records
                .iter()
                .map(|(name, record)| (name.clone(), record.redacted()))
                .collect(),
            ..self.clone()
        }
    }
}

impl StateRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, provider_id: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            provider_id: provider_id.to_string(),
            resolved_outputs: serde_json::Map::new(),
            last_applied_properties: BTreeMap::new(),
            dependencies: Vec::new(),
            properties_hash: String::new(),
            sensitive: BTreeSet::new(),
            provider: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A copy safe to display: sensitive properties and same-named outputs masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            last_applied_properties: redact_properties(&self.last_applied_properties, &self.sensitive),
            resolved_outputs: self
                .resolved_outputs
                .iter()
                .map(|(k, v)| {
                    let shown = if self.sensitive.contains(k) {
                        serde_json::Value::String(crate::model::MASK.to_string())
                    } else {
                        v.clone()
                    };
                    (k.clone(), shown)
                })
                .collect(),
            provider: self.provider.as_ref().map(ProviderOverrides::redacted),
            ..self.clone()
        }
    }

    /// Returns true if the output key holds a secret.
    #[must_use]
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.contains(key)
    }
}

impl PendingOperation {
    /// Creates a journal entry stamped now.
    #[must_use]
    pub fn new(resource: &str, action: PendingAction, provider_id: Option<String>) -> Self {
        Self {
            resource: resource.to_string(),
            action,
            provider_id,
            started_at: Utc::now(),
        }
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, fingerprint: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            fingerprint: fingerprint.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        fingerprint: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, fingerprint, resources)
        }
    }
}

impl std::fmt::Display for PendingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{action}")
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
