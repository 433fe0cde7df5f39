// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

pub mod build;

use fnv::FnvHashMap as HashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use convergence_model::{ConvergenceError, ConvergenceNode};

type PGraph = DiGraph<ConvergenceNode, (), u32>;

/// An in-memory DAG over `(resource_id, is_update)` nodes (spec §4.2). Edges run
/// `(requirer, required)`: a requirer is only ready to run once everything it requires has
/// completed. Unlike `pants::graph::Graph`, this is a plain structural graph with no memoization
/// or async execution machinery — one is built fresh per traversal from the template compiler's
/// output and consulted by the Check-Runner/Propagator for `requires`/`required_by`/roots/leaves
/// and topological order.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    pg: PGraph,
    index: HashMap<ConvergenceNode, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            pg: DiGraph::new(),
            index: HashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, node: &ConvergenceNode) -> bool {
        self.index.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = ConvergenceNode> + '_ {
        self.index.keys().copied()
    }

    /// Ensures `node` is present (with no edges) and returns its internal index. Idempotent.
    pub fn ensure_node(&mut self, node: ConvergenceNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.pg.add_node(node);
        self.index.insert(node, idx);
        idx
    }

    /// Adds the edge `requirer -> required` (requirer depends on required), creating either
    /// endpoint if it isn't already present. A `None`-valued `required` in the original design
    /// (a disjoint node with no dependencies) is represented here by calling `ensure_node` alone.
    pub fn add_edge(&mut self, requirer: ConvergenceNode, required: ConvergenceNode) {
        let r = self.ensure_node(requirer);
        let q = self.ensure_node(required);
        if self.pg.find_edge(r, q).is_none() {
            self.pg.add_edge(r, q, ());
        }
    }

    /// The nodes this one directly depends on.
    pub fn requires(&self, node: ConvergenceNode) -> Vec<ConvergenceNode> {
        let Some(&idx) = self.index.get(&node) else {
            return Vec::new();
        };
        self.pg
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|i| self.pg[i])
            .collect()
    }

    /// The direct dependents of this node — those that require it.
    pub fn required_by(&self, node: ConvergenceNode) -> Vec<ConvergenceNode> {
        let Some(&idx) = self.index.get(&node) else {
            return Vec::new();
        };
        self.pg
            .neighbors_directed(idx, Direction::Incoming)
            .map(|i| self.pg[i])
            .collect()
    }

    /// Nodes with no dependents — nothing in the graph requires them. These are the last nodes
    /// to finish in a traversal; `check_stack_complete` (§4.3.5) waits for all of them.
    pub fn roots(&self) -> Vec<ConvergenceNode> {
        self.index
            .values()
            .filter(|&&idx| {
                self.pg
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|&idx| self.pg[idx])
            .collect()
    }

    /// Nodes with no requirements — the nodes a caller seeds first (spec §2's "seed roots
    /// (leaves of graph)").
    pub fn leaves(&self) -> Vec<ConvergenceNode> {
        self.index
            .values()
            .filter(|&&idx| {
                self.pg
                    .neighbors_directed(idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|&idx| self.pg[idx])
            .collect()
    }

    /// A topological iteration order: every node appears only after everything it requires has
    /// already appeared (leaves first, roots last) — the order convergence actually executes in.
    /// Fails with `CircularDependency` if the graph isn't acyclic.
    pub fn topological_order(&self) -> Result<Vec<ConvergenceNode>, ConvergenceError> {
        let mut remaining: HashMap<ConvergenceNode, usize> = self
            .index
            .keys()
            .map(|&n| (n, self.requires(n).len()))
            .collect();

        let mut ready: Vec<ConvergenceNode> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&n, _)| n)
            .collect();
        ready.sort_by_key(ord_key);

        let mut order = Vec::with_capacity(self.index.len());
        let mut queue = std::collections::VecDeque::from(ready);

        while let Some(node) = queue.pop_front() {
            remaining.remove(&node);
            order.push(node);

            let mut newly_ready = Vec::new();
            for dependent in self.required_by(node) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        newly_ready.push(dependent);
                    }
                }
            }
            newly_ready.sort_by_key(ord_key);
            queue.extend(newly_ready);
        }

        if !remaining.is_empty() {
            let cycle = self.render_cycle(&remaining);
            return Err(ConvergenceError::CircularDependency { cycle });
        }

        Ok(order)
    }

    /// The reverse of `topological_order` — roots first, leaves last.
    pub fn reverse_topological_order(&self) -> Result<Vec<ConvergenceNode>, ConvergenceError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    fn render_cycle(&self, remaining: &HashMap<ConvergenceNode, usize>) -> String {
        let mut nodes: Vec<_> = remaining.keys().copied().collect();
        nodes.sort_by_key(ord_key);
        let pairs: Vec<String> = nodes
            .into_iter()
            .map(|n| {
                let mut reqs = self.requires(n);
                reqs.retain(|r| remaining.contains_key(r));
                reqs.sort_by_key(ord_key);
                let reqs_str = reqs
                    .into_iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{n}: {{{reqs_str}}}")
            })
            .collect();
        format!("{{{}}}", pairs.join(", "))
    }

    /// The sub-graph consisting of `node` and everything that (transitively) requires it —
    /// "walking up" from a base node toward its dependents. Mirrors the original
    /// `Dependencies.__getitem__`.
    pub fn subgraph_from(&self, node: ConvergenceNode) -> DependencyGraph {
        let mut out = DependencyGraph::new();
        if !self.contains(&node) {
            return out;
        }
        out.ensure_node(node);

        let mut stack = vec![node];
        let mut visited = std::collections::HashSet::new();
        visited.insert(node);

        while let Some(current) = stack.pop() {
            for requirer in self.required_by(current) {
                out.add_edge(requirer, current);
                if visited.insert(requirer) {
                    stack.push(requirer);
                }
            }
        }

        out
    }
}

fn ord_key(n: &ConvergenceNode) -> (i64, bool, Option<i64>) {
    (n.resource_id, n.is_update(), n.snapshot_id)
}

#[cfg(test)]
mod tests;
