//! Property-level diffs between the last applied and the desired declaration.
//!
//! Diffs are taken per top-level property key. Values compare structurally:
//! two output references are equal when they name the same resource and
//! output, regardless of what that output currently resolves to.
//!
//! Changes to sensitive keys keep their values for comparison but never
//! show them: both `Display` and `Serialize` mask them.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::Value;

/// One changed top-level property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Property key.
    pub field: String,
    /// Last applied value, `None` if the key is new.
    pub old: Option<Value>,
    /// Desired value, `None` if the key was removed.
    pub new: Option<Value>,
    /// The value is secret.
    pub sensitive: bool,
}

/// Every changed property of one resource, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PropertyDiff {
    /// Changed properties.
    pub changes: Vec<FieldChange>,
}

impl PropertyDiff {
    /// Compares two property bags. Keys in `sensitive` are masked when shown.
    #[must_use]
    pub fn between(
        old: &BTreeMap<String, Value>,
        new: &BTreeMap<String, Value>,
        sensitive: &BTreeSet<String>,
    ) -> Self {
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

        let changes = keys
            .into_iter()
            .filter_map(|key| {
                let before = old.get(key);
                let after = new.get(key);
                (before != after).then(|| FieldChange {
                    field: key.clone(),
                    old: before.cloned(),
                    new: after.cloned(),
                    sensitive: sensitive.contains(key),
                })
            })
            .collect();

        Self { changes }
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changed keys, sorted.
    #[must_use]
    pub fn fields(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.field.clone()).collect()
    }
}

fn show(value: Option<&Value>) -> String {
    value.map_or_else(|| "(none)".to_string(), ToString::to_string)
}

impl FieldChange {
    fn shown(&self, value: Option<&Value>) -> Option<Value> {
        if self.sensitive {
            value.map(|_| Value::masked())
        } else {
            value.cloned()
        }
    }
}

impl Serialize for FieldChange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FieldChange", 4)?;
        state.serialize_field("field", &self.field)?;
        state.serialize_field("old", &self.shown(self.old.as_ref()))?;
        state.serialize_field("new", &self.shown(self.new.as_ref()))?;
        state.serialize_field("sensitive", &self.sensitive)?;
        state.end()
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            return write!(f, "{}: (sensitive)", self.field);
        }
        write!(
            f,
            "{}: {} -> {}",
            self.field,
            show(self.old.as_ref()),
            show(self.new.as_ref())
        )
    }
}

impl fmt::Display for PropertyDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{change}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_single_changed_field() {
        let old = props(&[("sku", "basic".into()), ("admin_enabled", true.into())]);
        let new = props(&[("sku", "standard".into()), ("admin_enabled", true.into())]);

        let diff = PropertyDiff::between(&old, &new, &BTreeSet::new());
        assert_eq!(diff.fields(), vec!["sku"]);
        assert_eq!(diff.to_string(), "{sku: basic -> standard}");
    }

    #[test]
    fn test_added_and_removed_keys() {
        let old = props(&[("tags", "old".into())]);
        let new = props(&[("zones", Value::List(vec!["1".into()]))]);

        let diff = PropertyDiff::between(&old, &new, &BTreeSet::new());
        assert_eq!(diff.fields(), vec!["tags", "zones"]);
        assert_eq!(diff.changes[0].new, None);
        assert_eq!(diff.changes[1].old, None);
    }

    #[test]
    fn test_references_compare_by_target() {
        let old = props(&[("subnet", Value::reference("subnet", "id"))]);
        let same = props(&[("subnet", Value::reference("subnet", "id"))]);
        let other = props(&[("subnet", Value::reference("subnet", "name"))]);

        assert!(PropertyDiff::between(&old, &same, &BTreeSet::new()).is_empty());
        assert_eq!(
            PropertyDiff::between(&old, &other, &BTreeSet::new()).to_string(),
            "{subnet: ${subnet.id} -> ${subnet.name}}"
        );
    }

    #[test]
    fn test_nested_change_reported_at_top_level() {
        let old = props(&[(
            "profile",
            Value::Map(BTreeMap::from([("vm_size".to_string(), "Standard_D2_v2".into())])),
        )]);
        let new = props(&[(
            "profile",
            Value::Map(BTreeMap::from([("vm_size".to_string(), "Standard_D4_v2".into())])),
        )]);

        assert_eq!(PropertyDiff::between(&old, &new, &BTreeSet::new()).fields(), vec!["profile"]);
    }

    #[test]
    fn test_sensitive_change_is_masked() {
        let old = props(&[("password", "hunter2".into()), ("sku", "basic".into())]);
        let new = props(&[("password", "hunter3".into()), ("sku", "standard".into())]);
        let sensitive = BTreeSet::from(["password".to_string()]);

        let diff = PropertyDiff::between(&old, &new, &sensitive);
        assert_eq!(diff.fields(), vec!["password", "sku"]);
        assert_eq!(diff.to_string(), "{password: (sensitive), sku: basic -> standard}");

        let json = serde_json::to_string(&diff).unwrap();
        assert!(!json.contains("hunter"));
        assert!(json.contains("standard"));
    }
}
