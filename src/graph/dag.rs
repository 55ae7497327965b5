//! The dependency graph produced by the builder.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::ResourceNode;

/// Directed acyclic graph over declared resources.
///
/// An edge `A -> B` means `B` must be applied before `A`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Underlying graph; node weights are the declarations.
    pub(super) graph: DiGraph<ResourceNode, ()>,
    /// Name to node index.
    pub(super) index: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph holds no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Looks up a resource by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.index.get(name).map(|&ix| &self.graph[ix])
    }

    /// Returns true if a resource with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates over resources in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.index.values().map(|&ix| &self.graph[ix])
    }

    /// Resource names in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Names of the resources `name` must be applied after, sorted.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Names of the resources that must be applied after `name`, sorted.
    #[must_use]
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> BTreeSet<String> {
        self.index
            .get(name)
            .map(|&ix| {
                self.graph
                    .neighbors_directed(ix, direction)
                    .map(|n| self.graph[n].name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All transitive dependents of `name`, excluding itself.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<String> = self.dependents(name).into_iter().collect();

        while let Some(next) = stack.pop() {
            if found.insert(next.clone()) {
                stack.extend(self.dependents(&next));
            }
        }

        found
    }

    /// Resources ordered so that every dependency precedes its dependents.
    ///
    /// Ties are broken by name so the order is stable across runs.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ResourceNode> {
        let mut remaining: BTreeMap<&str, usize> = self
            .index
            .iter()
            .map(|(name, &ix)| {
                let out = self.graph.neighbors_directed(ix, Direction::Outgoing).count();
                (name.as_str(), out)
            })
            .collect();

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.len());

        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            let ix = self.index[name];
            order.push(&self.graph[ix]);

            for dependent in self.graph.neighbors_directed(ix, Direction::Incoming) {
                let dependent_name = self.graph[dependent].name.as_str();
                if let Some(count) = remaining.get_mut(dependent_name) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent_name);
                    }
                }
            }
        }

        order
    }
}
