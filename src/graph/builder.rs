//! Assembles declared resources into a [`DependencyGraph`].

use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::model::ResourceNode;

use super::dag::DependencyGraph;

/// Builds dependency graphs from declarations.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph, inferring edges from output references.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateResource`] for a repeated name,
    /// [`GraphError::UnknownReference`] for a dependency on an undeclared
    /// resource, and [`GraphError::Cycle`] when the graph is not acyclic.
    pub fn build(&self, resources: &[ResourceNode]) -> Result<DependencyGraph> {
        let mut graph = DiGraph::with_capacity(resources.len(), resources.len());
        let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();

        for node in resources {
            if index.contains_key(&node.name) {
                return Err(GraphError::DuplicateResource {
                    name: node.name.clone(),
                }
                .into());
            }
            let ix = graph.add_node(node.clone());
            index.insert(node.name.clone(), ix);
        }

        for node in resources {
            let from = index[&node.name];
            for target in node.dependency_names() {
                let Some(&to) = index.get(&target) else {
                    return Err(GraphError::UnknownReference {
                        from: node.name.clone(),
                        target,
                    }
                    .into());
                };
                graph.add_edge(from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            let cycle = find_cycle(&graph);
            return Err(GraphError::Cycle { cycle }.into());
        }

        debug!(
            "Built dependency graph: {} resources, {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(DependencyGraph { graph, index })
    }
}

/// Extracts one cycle, starting from the smallest name involved in any cycle.
fn find_cycle(graph: &DiGraph<ResourceNode, ()>) -> Vec<String> {
    let cyclic: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .collect();

    let Some((start, members)) = cyclic
        .iter()
        .filter_map(|scc| {
            let start = scc.iter().copied().min_by(|a, b| graph[*a].name.cmp(&graph[*b].name))?;
            Some((start, scc.iter().copied().collect::<BTreeSet<_>>()))
        })
        .min_by(|(a, _), (b, _)| graph[*a].name.cmp(&graph[*b].name))
    else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut visited = BTreeSet::from([start]);
    if walk_back_to(graph, start, start, &members, &mut path, &mut visited) {
        path.push(start);
    }

    path.into_iter().map(|ix| graph[ix].name.clone()).collect()
}

/// Depth-first search for a path from `current` back to `start` inside one component.
fn walk_back_to(
    graph: &DiGraph<ResourceNode, ()>,
    current: NodeIndex,
    start: NodeIndex,
    members: &BTreeSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
    visited: &mut BTreeSet<NodeIndex>,
) -> bool {
    let mut next: Vec<NodeIndex> = graph
        .neighbors_directed(current, Direction::Outgoing)
        .filter(|n| members.contains(n))
        .collect();
    next.sort_by(|a, b| graph[*a].name.cmp(&graph[*b].name));

    for n in next {
        if n == start {
            return true;
        }
        if visited.insert(n) {
            path.push(n);
            if walk_back_to(graph, n, start, members, path, visited) {
                return true;
            }
            path.pop();
        }
    }

    false
}
