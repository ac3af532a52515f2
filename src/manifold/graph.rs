// src/manifold/graph.rs

use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::Direction::Incoming;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{EngineError, Result};
use crate::manifold::Manifolds;

/// Internal node structure: immediate inputs and dependents.
#[derive(Debug, Clone, Default)]
struct GraphNode {
    inputs: Vec<String>,
    dependents: Vec<String>,
}

/// Validated, static view of a manifold set.
///
/// Construction rejects unknown inputs, self-dependencies and cycles, so
/// an existing `ManifoldGraph` always has a valid install order.
#[derive(Debug, Clone)]
pub struct ManifoldGraph {
    nodes: BTreeMap<String, GraphNode>,
    order: Vec<String>,
}

impl ManifoldGraph {
    pub fn new(manifolds: &Manifolds) -> Result<Self> {
        validate_inputs(manifolds)?;
        let order = install_order(manifolds)?;

        let mut nodes: BTreeMap<String, GraphNode> = manifolds
            .iter()
            .map(|(name, manifold)| {
                let node = GraphNode {
                    inputs: manifold.inputs.clone(),
                    dependents: Vec::new(),
                };
                (name.clone(), node)
            })
            .collect();

        for (name, manifold) in manifolds {
            for input in &manifold.inputs {
                if let Some(node) = nodes.get_mut(input) {
                    if !node.dependents.contains(name) {
                        node.dependents.push(name.clone());
                    }
                }
            }
        }

        Ok(Self { nodes, order })
    }

    /// Manifold names, every one after all of its inputs. Ties are broken
    /// lexicographically.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.inputs.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn validate_inputs(manifolds: &Manifolds) -> Result<()> {
    for (name, manifold) in manifolds {
        for input in &manifold.inputs {
            if input == name {
                return Err(EngineError::SelfDependency(name.clone()));
            }
            if !manifolds.contains_key(input) {
                return Err(EngineError::UnknownInput {
                    name: name.clone(),
                    input: input.clone(),
                });
            }
        }
    }
    Ok(())
}

fn install_order(manifolds: &Manifolds) -> Result<Vec<String>> {
    // Edge direction: input -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in manifolds.keys() {
        graph.add_node(name.as_str());
    }
    for (name, manifold) in manifolds {
        for input in &manifold.inputs {
            graph.add_edge(input.as_str(), name.as_str(), ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(EngineError::Cycle(cycle.node_id().to_string()));
    }

    // Kahn's algorithm over a sorted frontier keeps the order stable.
    let mut remaining: BTreeMap<&str, usize> = manifolds
        .keys()
        .map(|name| {
            let name = name.as_str();
            (name, graph.neighbors_directed(name, Incoming).count())
        })
        .collect();
    let mut order = Vec::with_capacity(manifolds.len());
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, pending)| **pending == 0)
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            // Unreachable after a successful toposort.
            break;
        }
        for name in ready {
            remaining.remove(name);
            order.push(name.to_string());
            for dependent in graph.neighbors(name) {
                if let Some(pending) = remaining.get_mut(dependent) {
                    *pending = pending.saturating_sub(1);
                }
            }
        }
    }
    Ok(order)
}
