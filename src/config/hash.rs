//! Declaration fingerprints.
//!
//! Deterministic SHA-256 hashes of resource declarations, used to stamp
//! plans and run history and to record what each resource was applied with.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::model::{Declaration, ResourceNode, Value};

/// Hasher for computing declaration fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes a full declaration, resources and exports.
    ///
    /// Declaration order does not matter; only content does.
    #[must_use]
    pub fn hash_declaration(&self, declaration: &Declaration) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.hash_resources(declaration.resources.iter()).as_bytes());

        for (name, reference) in &declaration.exports {
            hasher.update(b"export\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(reference.to_string().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Hashes a set of resources independent of iteration order.
    #[must_use]
    pub fn hash_resources<'a>(&self, resources: impl Iterator<Item = &'a ResourceNode>) -> String {
        let mut per_node: Vec<(&str, String)> = resources
            .map(|node| (node.name.as_str(), self.hash_node(node)))
            .collect();
        per_node.sort_unstable();

        let mut hasher = Sha256::new();
        for (name, hash) in per_node {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(hash.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Hashes one resource: type, name, properties and explicit dependencies.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();

        hasher.update(node.resource_type.as_bytes());
        hasher.update(b"\0");
        hasher.update(node.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.hash_properties(&node.properties).as_bytes());

        for dep in &node.explicit_deps {
            hasher.update(b"dep\0");
            hasher.update(dep.as_str().as_bytes());
        }

        if let Some(provider) = &node.provider {
            hasher.update(b"provider\0");
            if let Some(location) = &provider.location {
                feed(&mut hasher, location);
            }
            feed_map(&mut hasher, &provider.credentials);
            feed_map(&mut hasher, &provider.tags);
        }

        hex::encode(hasher.finalize())
    }

    /// Hashes a property bag.
    #[must_use]
    pub fn hash_properties(&self, properties: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        feed_map(&mut hasher, properties);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

fn feed_map(hasher: &mut Sha256, map: &BTreeMap<String, Value>) {
    hasher.update(b"{");
    for (key, value) in map {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        feed(hasher, value);
        hasher.update(b";");
    }
    hasher.update(b"}");
}

/// Feeds a value with type tags so `"1"` and `1` hash differently.
fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.len().to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Reference(r) => {
            hasher.update(b"r");
            hasher.update(r.to_string().as_bytes());
        }
        Value::List(items) => {
            hasher.update(b"[");
            for item in items {
                feed(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        Value::Map(map) => feed_map(hasher, map),
    }
}
