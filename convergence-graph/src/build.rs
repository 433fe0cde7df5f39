// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Constructs a `DependencyGraph` from the resource requirement edges a stack's template
//! compiler produces, applying the update/cleanup/replacement edge rules of §4.2.

use std::collections::BTreeMap;

use convergence_model::{ConvergenceNode, ResourceId};

use crate::DependencyGraph;

/// One resource's requirements within a single template (either the new template being
/// converged to, or the old one being torn down).
#[derive(Debug, Clone)]
pub struct ResourceRequirements {
    pub resource_id: ResourceId,
    pub requires: Vec<ResourceId>,
}

impl ResourceRequirements {
    pub fn new(resource_id: ResourceId, requires: Vec<ResourceId>) -> Self {
        Self {
            resource_id,
            requires,
        }
    }
}

/// Everything needed to build the graph for a stack create/update traversal: the resources of
/// the new template, the resources being removed entirely (present in the old template, absent
/// from the new one), and the old-resource-id -> new-resource-id map for in-place replacements
/// (same logical resource, new underlying infrastructure object).
#[derive(Debug, Clone, Default)]
pub struct UpdateTraversalSpec {
    pub new_template: Vec<ResourceRequirements>,
    pub removed: Vec<ResourceRequirements>,
    pub replacements: BTreeMap<ResourceId, ResourceId>,
}

/// Builds the traversal graph for a create/update. Update nodes follow the new template's
/// requirement edges directly: `update(r)` depends on `update(req)` for every `req` in `r`'s
/// requirements, so dependencies converge before dependents. Cleanup nodes for resources being
/// removed run in the *reverse* order of their old requirement edges — a resource that required
/// another for its own creation must be torn down first, so `cleanup(req)` depends on
/// `cleanup(r)`. Replacements get an additional ordering edge, `cleanup(old) -> update(new)`,
/// guaranteeing the replacement is stood up before its predecessor is cleaned up.
pub fn build_update_graph(spec: &UpdateTraversalSpec) -> DependencyGraph {
    let mut graph = DependencyGraph::new();

    for resource in &spec.new_template {
        let requirer = ConvergenceNode::update(resource.resource_id);
        graph.ensure_node(requirer);
        for &required in &resource.requires {
            graph.add_edge(requirer, ConvergenceNode::update(required));
        }
    }

    for resource in &spec.removed {
        let r = ConvergenceNode::cleanup(resource.resource_id);
        graph.ensure_node(r);
        for &required in &resource.requires {
            // reversed: the old dependency's cleanup now depends on this resource's cleanup.
            graph.add_edge(ConvergenceNode::cleanup(required), r);
        }
    }

    for (&old_id, &new_id) in &spec.replacements {
        graph.add_edge(
            ConvergenceNode::cleanup(old_id),
            ConvergenceNode::update(new_id),
        );
    }

    graph
}

/// Everything needed to build the graph for a stack delete traversal: every resource currently
/// in the stack, with its (create-time) requirements.
#[derive(Debug, Clone, Default)]
pub struct DeleteTraversalSpec {
    pub resources: Vec<ResourceRequirements>,
}

/// Builds a cleanup-only graph for a full stack delete. As with partial removal above, edges are
/// reversed relative to the create-time requirement direction so that dependents are deleted
/// before their dependencies.
pub fn build_delete_graph(spec: &DeleteTraversalSpec) -> DependencyGraph {
    let mut graph = DependencyGraph::new();

    for resource in &spec.resources {
        let r = ConvergenceNode::cleanup(resource.resource_id);
        graph.ensure_node(r);
        for &required in &resource.requires {
            graph.add_edge(ConvergenceNode::cleanup(required), r);
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_graph_orders_dependency_before_dependent() {
        // Instance requires Network: creation order Network, then Instance.
        let spec = UpdateTraversalSpec {
            new_template: vec![
                ResourceRequirements::new(1, vec![]),    // Network
                ResourceRequirements::new(2, vec![1]),   // Instance requires Network
            ],
            removed: vec![],
            replacements: BTreeMap::new(),
        };
        let graph = build_update_graph(&spec);
        let order = graph.topological_order().unwrap();
        let network_pos = order
            .iter()
            .position(|n| *n == ConvergenceNode::update(1))
            .unwrap();
        let instance_pos = order
            .iter()
            .position(|n| *n == ConvergenceNode::update(2))
            .unwrap();
        assert!(network_pos < instance_pos);
    }

    #[test]
    fn delete_graph_reverses_order() {
        // Same shape, but deleting: Instance must go before Network.
        let spec = DeleteTraversalSpec {
            resources: vec![
                ResourceRequirements::new(1, vec![]),
                ResourceRequirements::new(2, vec![1]),
            ],
        };
        let graph = build_delete_graph(&spec);
        let order = graph.topological_order().unwrap();
        let network_pos = order
            .iter()
            .position(|n| *n == ConvergenceNode::cleanup(1))
            .unwrap();
        let instance_pos = order
            .iter()
            .position(|n| *n == ConvergenceNode::cleanup(2))
            .unwrap();
        assert!(instance_pos < network_pos);
    }

    #[test]
    fn replacement_orders_new_resource_before_old_cleanup() {
        let mut replacements = BTreeMap::new();
        replacements.insert(10, 20);
        let spec = UpdateTraversalSpec {
            new_template: vec![ResourceRequirements::new(20, vec![])],
            removed: vec![ResourceRequirements::new(10, vec![])],
            replacements,
        };
        let graph = build_update_graph(&spec);
        let order = graph.topological_order().unwrap();
        let new_pos = order
            .iter()
            .position(|n| *n == ConvergenceNode::update(20))
            .unwrap();
        let old_cleanup_pos = order
            .iter()
            .position(|n| *n == ConvergenceNode::cleanup(10))
            .unwrap();
        assert!(new_pos < old_cleanup_pos);
    }
}
