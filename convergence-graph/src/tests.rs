// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use convergence_model::ConvergenceNode;

use super::DependencyGraph;

fn u(id: i64) -> ConvergenceNode {
    ConvergenceNode::update(id)
}

#[test]
fn single_disjoint_node_is_root_and_leaf() {
    let mut graph = DependencyGraph::new();
    graph.ensure_node(u(1));

    assert_eq!(graph.roots(), vec![u(1)]);
    assert_eq!(graph.leaves(), vec![u(1)]);
    assert_eq!(graph.topological_order().unwrap(), vec![u(1)]);
}

#[test]
fn linear_chain_orders_leaves_first() {
    // 1 <- 2 <- 3 (3 requires 2, 2 requires 1)
    let mut graph = DependencyGraph::new();
    graph.add_edge(u(2), u(1));
    graph.add_edge(u(3), u(2));

    assert_eq!(graph.leaves(), vec![u(1)]);
    assert_eq!(graph.roots(), vec![u(3)]);
    assert_eq!(graph.requires(u(3)), vec![u(2)]);
    assert_eq!(graph.required_by(u(1)), vec![u(2)]);

    let order = graph.topological_order().unwrap();
    assert_eq!(order, vec![u(1), u(2), u(3)]);

    let rev = graph.reverse_topological_order().unwrap();
    assert_eq!(rev, vec![u(3), u(2), u(1)]);
}

#[test]
fn diamond_orders_shared_dependency_once_before_both_branches() {
    // 4 requires 2 and 3; 2 and 3 both require 1.
    let mut graph = DependencyGraph::new();
    graph.add_edge(u(2), u(1));
    graph.add_edge(u(3), u(1));
    graph.add_edge(u(4), u(2));
    graph.add_edge(u(4), u(3));

    assert_eq!(graph.leaves(), vec![u(1)]);
    assert_eq!(graph.roots(), vec![u(4)]);

    let order = graph.topological_order().unwrap();
    let pos = |n| order.iter().position(|&x| x == n).unwrap();
    assert!(pos(u(1)) < pos(u(2)));
    assert!(pos(u(1)) < pos(u(3)));
    assert!(pos(u(2)) < pos(u(4)));
    assert!(pos(u(3)) < pos(u(4)));
}

#[test]
fn two_node_cycle_is_detected_and_named() {
    let mut graph = DependencyGraph::new();
    graph.add_edge(u(1), u(2));
    graph.add_edge(u(2), u(1));

    let err = graph.topological_order().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("(1, update)"));
    assert!(message.contains("(2, update)"));
}

#[test]
fn subgraph_from_includes_transitive_dependents_only() {
    // 1 <- 2 <- 3, and an unrelated disjoint node 9.
    let mut graph = DependencyGraph::new();
    graph.add_edge(u(2), u(1));
    graph.add_edge(u(3), u(2));
    graph.ensure_node(u(9));

    let sub = graph.subgraph_from(u(1));
    let mut nodes: Vec<_> = sub.nodes().collect();
    nodes.sort();
    assert_eq!(nodes, vec![u(1), u(2), u(3)]);
    assert!(!sub.contains(&u(9)));
}

#[test]
fn ensure_node_and_add_edge_are_idempotent() {
    let mut graph = DependencyGraph::new();
    graph.add_edge(u(1), u(2));
    graph.add_edge(u(1), u(2));
    graph.ensure_node(u(1));

    assert_eq!(graph.len(), 2);
    assert_eq!(graph.requires(u(1)), vec![u(2)]);
}
