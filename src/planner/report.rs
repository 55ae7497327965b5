//! Run reports.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{MASK, OutputReference};
use crate::provider::Outputs;

/// Terminal status of one resource in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Created by this run.
    Created,
    /// Updated by this run.
    Updated,
    /// Deleted by this run, or found already gone.
    Deleted,
    /// Nothing to do.
    NoOp,
    /// The provider call failed.
    Failed,
    /// Never attempted.
    Skipped,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every change applied.
    Success,
    /// At least one resource failed or was skipped.
    PartialFailure,
    /// Stopped by an abort signal.
    Aborted,
}

/// Outcome for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceResult {
    /// Logical name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Terminal status.
    pub status: ResourceStatus,
    /// Provider handle after the run, if the resource exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Why the resource failed or was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Overall outcome.
    pub status: RunStatus,
    /// Per-resource outcomes in plan order.
    pub resources: Vec<ResourceResult>,
    /// Resolved exports.
    pub exports: BTreeMap<String, serde_json::Value>,
    /// Exports whose source output is unavailable.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved_exports: Vec<String>,
    /// Fingerprint of the applied declaration.
    pub fingerprint: String,
    /// Output table at the end of the run.
    #[serde(skip)]
    pub outputs: BTreeMap<String, Outputs>,
    /// Secret output keys per resource.
    #[serde(skip)]
    pub sensitive: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceStatus {
    /// Returns true for statuses that let dependents proceed.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted | Self::NoOp)
    }

    /// Returns true if the resource was changed.
    #[must_use]
    pub const fn is_change(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

impl RunReport {
    /// Looks up the result for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceResult> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Status of a resource, if it was part of the run.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<ResourceStatus> {
        self.get(name).map(|r| r.status)
    }

    /// Number of resources with the given status.
    #[must_use]
    pub fn count(&self, status: ResourceStatus) -> usize {
        self.resources.iter().filter(|r| r.status == status).count()
    }

    /// Names of resources that were changed.
    #[must_use]
    pub fn changed(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.status.is_change())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Returns true if every change applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Resolves exported outputs against the output table.
    pub fn resolve_exports(&mut self, exports: &BTreeMap<String, OutputReference>) {
        let (resolved, unresolved) = resolve_exports(&self.outputs, exports, &self.sensitive);
        self.exports = resolved;
        self.unresolved_exports = unresolved;
    }
}

/// Looks up each export in an output table.
///
/// Returns the resolved values and the names of exports whose resource or
/// output field is missing. Exports of a key listed in `sensitive` for
/// their resource resolve to the mask.
#[must_use]
pub fn resolve_exports(
    outputs: &BTreeMap<String, Outputs>,
    exports: &BTreeMap<String, OutputReference>,
    sensitive: &BTreeMap<String, BTreeSet<String>>,
) -> (BTreeMap<String, serde_json::Value>, Vec<String>) {
    let mut resolved = BTreeMap::new();
    let mut unresolved = Vec::new();

    for (name, reference) in exports {
        let secret = sensitive.get(&reference.resource).is_some_and(|keys| {
            reference
                .output
                .split('.')
                .next()
                .is_some_and(|key| keys.contains(key))
        });

        match outputs
            .get(&reference.resource)
            .and_then(|o| reference.lookup(o))
        {
            Some(_) if secret => {
                resolved.insert(name.clone(), serde_json::Value::String(MASK.to_string()));
            }
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => unresolved.push(name.clone()),
        }
    }

    (resolved, unresolved)
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::NoOp => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}
