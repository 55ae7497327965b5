//! Property values and cross-resource output references.
//!
//! A [`Value`] is either a literal or an [`OutputReference`]: a lazy
//! pointer to an output field of another resource which only becomes known
//! once that resource has been applied. References may appear anywhere
//! inside lists and maps.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ProviderError;

/// Key used to encode a reference inside persisted JSON.
const REF_KEY: &str = "$ref";

/// Shown in place of secret values.
pub const MASK: &str = "********";

/// A pointer to `<resource>.<output path>`.
///
/// The output path may descend into nested outputs with further dots;
/// numeric segments index into arrays (`service.status.ingress.0.ip`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputReference {
    /// Name of the referenced resource.
    pub resource: String,
    /// Output field path on that resource.
    pub output: String,
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// JSON null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Numeric literal.
    Number(serde_json::Number),
    /// String literal.
    String(String),
    /// Lazy reference to another resource's output.
    Reference(OutputReference),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map, kept sorted for deterministic comparison.
    Map(BTreeMap<String, Value>),
}

impl OutputReference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Walks the output path inside a resource's outputs.
    #[must_use]
    pub fn lookup(&self, outputs: &serde_json::Map<String, serde_json::Value>) -> Option<serde_json::Value> {
        let mut segments = self.output.split('.');
        let first = segments.next()?;
        let mut current = outputs.get(first)?;

        for segment in segments {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current.clone())
    }
}

impl FromStr for OutputReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource, output) = s
            .split_once('.')
            .ok_or_else(|| format!("Reference '{s}' must have the form <resource>.<output>"))?;

        if resource.is_empty() || output.is_empty() || output.split('.').any(str::is_empty) {
            return Err(format!("Reference '{s}' has an empty segment"));
        }

        Ok(Self::new(resource, output))
    }
}

impl TryFrom<String> for OutputReference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputReference> for String {
    fn from(reference: OutputReference) -> Self {
        reference.to_string()
    }
}

impl fmt::Display for OutputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.output)
    }
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Creates a reference value.
    #[must_use]
    pub fn reference(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Reference(OutputReference::new(resource, output))
    }

    /// Converts a plain JSON value, decoding `{"$ref": "a.b"}` objects into references.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1
                    && let Some(serde_json::Value::String(target)) = map.get(REF_KEY)
                    && let Ok(reference) = target.parse::<OutputReference>()
                {
                    return Self::Reference(reference);
                }
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect())
            }
        }
    }

    /// Encodes the value as JSON, keeping references as `{"$ref": "a.b"}`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Reference(r) => serde_json::json!({ REF_KEY: r.to_string() }),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Returns every reference contained in this value, depth first.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputReference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a OutputReference>) {
        match self {
            Self::Reference(r) => found.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(found)),
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => {}
        }
    }

    /// Returns true if the value contains no references.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.references().is_empty()
    }

    /// The placeholder shown in place of a secret.
    #[must_use]
    pub fn masked() -> Self {
        Self::String(MASK.to_string())
    }

    /// Substitutes every reference using `lookup`, producing a plain JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::MissingOutput`] when `lookup` cannot resolve a reference.
    pub fn resolve<F>(&self, lookup: &F) -> Result<serde_json::Value, ProviderError>
    where
        F: Fn(&OutputReference) -> Option<serde_json::Value>,
    {
        Ok(match self {
            Self::Reference(r) => lookup(r).ok_or_else(|| ProviderError::MissingOutput {
                resource: r.resource.clone(),
                output: r.output.clone(),
            })?,
            Self::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.resolve(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
                    .collect::<Result<_, ProviderError>>()?,
            ),
            literal => literal.to_json(),
        })
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from_json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<OutputReference> for Value {
    fn from(r: OutputReference) -> Self {
        Self::Reference(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Reference(r) => write!(f, "${{{r}}}"),
            Self::List(_) | Self::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference() {
        let r: OutputReference = "subnet.id".parse().unwrap();
        assert_eq!(r.resource, "subnet");
        assert_eq!(r.output, "id");

        let nested: OutputReference = "service.status.ingress.0.ip".parse().unwrap();
        assert_eq!(nested.resource, "service");
        assert_eq!(nested.output, "status.ingress.0.ip");

        assert!("subnet".parse::<OutputReference>().is_err());
        assert!("subnet.".parse::<OutputReference>().is_err());
        assert!(".id".parse::<OutputReference>().is_err());
    }

    #[test]
    fn test_lookup_nested_output() {
        let outputs = json!({
            "status": { "ingress": [ { "ip": "20.1.2.3" } ] }
        });
        let outputs = outputs.as_object().unwrap();

        let r = OutputReference::new("service", "status.ingress.0.ip");
        assert_eq!(r.lookup(outputs), Some(json!("20.1.2.3")));

        let missing = OutputReference::new("service", "status.egress");
        assert_eq!(missing.lookup(outputs), None);
    }

    #[test]
    fn test_json_reference_encoding() {
        let value = Value::Map(BTreeMap::from([
            ("scope".to_string(), Value::reference("acr", "id")),
            ("role".to_string(), Value::string("AcrPull")),
        ]));

        let json = value.to_json();
        assert_eq!(json["scope"], json!({ "$ref": "acr.id" }));
        assert_eq!(Value::from_json(json), value);
    }

    #[test]
    fn test_references_are_found_when_nested() {
        let value = Value::List(vec![
            Value::Map(BTreeMap::from([(
                "vnet_subnet_id".to_string(),
                Value::reference("subnet", "id"),
            )])),
            Value::reference("rg", "name"),
        ]);

        let refs: Vec<String> = value.references().iter().map(ToString::to_string).collect();
        assert_eq!(refs, vec!["subnet.id", "rg.name"]);
        assert!(!value.is_literal());
    }

    #[test]
    fn test_resolve_substitutes_references() {
        let value = Value::Map(BTreeMap::from([
            ("location".to_string(), Value::reference("rg", "location")),
            ("count".to_string(), Value::from(2)),
        ]));

        let resolved = value
            .resolve(&|r: &OutputReference| (r.output == "location").then(|| json!("eastus")))
            .unwrap();
        assert_eq!(resolved, json!({ "location": "eastus", "count": 2 }));
    }

    #[test]
    fn test_resolve_reports_missing_output() {
        let value = Value::reference("acr", "login_server");
        let err = value.resolve(&|_: &OutputReference| None).unwrap_err();
        assert_eq!(
            err,
            ProviderError::MissingOutput {
                resource: "acr".into(),
                output: "login_server".into()
            }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::reference("rg", "name").to_string(), "${rg.name}");
        assert_eq!(Value::string("basic").to_string(), "basic");
    }
}
