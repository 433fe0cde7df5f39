// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Propagation (spec §4.3.4/§4.4): after a node finishes, write its contribution into every
//! successor's sync-point and, when a successor's predecessor set is fully satisfied, cast its
//! `check_resource`. Also the stack-completion check (§4.3.5), which is just propagation into a
//! stack-level sync-point keyed by `(stack_id, traversal, true)`.

use std::collections::{BTreeMap, BTreeSet};

use convergence_graph::DependencyGraph;
use convergence_model::{
    ConvergenceError, ConvergenceNode, NodeKind, Resource, ResourceId, SenderKey, StackId,
    SyncPointKey, TraversalId,
};
use convergence_syncpoint::SyncPointStore;

use crate::seams::CheckResourceDispatcher;

/// The node a just-completed resource propagates *as*. Ordinarily this is `(resource.id,
/// is_update)`, but a resource created mid-traversal as a replacement (§4.3.1) has no entry of
/// its own in the static graph — it impersonates the id it replaces so the graph's successors,
/// which were computed before the replacement existed, still see the completion (heat's
/// `_initiate_propagate_resource`).
fn effective_graph_key(graph: &DependencyGraph, resource: &Resource, is_update: bool) -> ConvergenceNode {
    let graph_key = ConvergenceNode {
        resource_id: resource.id,
        kind: NodeKind::from_is_update(is_update),
        snapshot_id: None,
    };
    if !graph.contains(&graph_key) {
        if let Some(replaces) = resource.replaces {
            return ConvergenceNode {
                resource_id: replaces,
                kind: graph_key.kind,
                snapshot_id: None,
            };
        }
    }
    graph_key
}

/// The payload a completed resource sends to one particular successor node.
fn input_data_for(graph_key: ConvergenceNode, resource: &Resource, req_node: ConvergenceNode) -> Option<serde_json::Value> {
    if req_node.is_update() {
        serde_json::to_value(resource.node_data()).ok()
    } else if req_node.resource_id != graph_key.resource_id {
        // Normal cleanup successor: tell it which physical resource (the replacement, if any,
        // else this one) it should consider `needed_by`.
        Some(serde_json::json!(resource.replaced_by.unwrap_or(resource.id)))
    } else {
        // Initiating clean-up of a resource that has just been replaced by itself under a new
        // id (the "self" case in heat's `_get_input_data`): no attribute payload to forward.
        None
    }
}

/// Writes this resource's completion into every direct dependent's sync-point, casting
/// `check_resource` for any successor whose sync-point is now fully satisfied. Mirrors
/// `_initiate_propagate_resource` plus `propagate_check_resource`.
pub async fn propagate_on_success(
    sync_points: &dyn SyncPointStore,
    dispatcher: &dyn CheckResourceDispatcher,
    graph: &DependencyGraph,
    traversal_id: TraversalId,
    resource: &Resource,
    is_update: bool,
    adopt_stack_data: Option<serde_json::Value>,
) -> Result<(), ConvergenceError> {
    let graph_key = effective_graph_key(graph, resource, is_update);

    for req_node in graph.required_by(graph_key) {
        let predecessors: BTreeSet<SenderKey> = graph
            .requires(req_node)
            .into_iter()
            .map(|n| SenderKey::new(n.resource_id, n.is_update()))
            .collect();
        let sender_key = SenderKey::new(graph_key.resource_id, graph_key.is_update());
        let sender_data = input_data_for(graph_key, resource, req_node);

        propagate_check_resource(
            sync_points,
            dispatcher,
            traversal_id,
            req_node.resource_id,
            req_node.is_update(),
            predecessors,
            sender_key,
            sender_data,
            adopt_stack_data.clone(),
        )
        .await?;
    }

    Ok(())
}

/// Writes one predecessor's contribution into `next_res_id`'s sync-point and casts its
/// `check_resource` the moment every predecessor has reported. The cast RPC is anycast
/// fire-and-forget; this function never waits on its effects.
#[allow(clippy::too_many_arguments)]
pub async fn propagate_check_resource(
    sync_points: &dyn SyncPointStore,
    dispatcher: &dyn CheckResourceDispatcher,
    traversal_id: TraversalId,
    next_res_id: ResourceId,
    is_update: bool,
    predecessors: BTreeSet<SenderKey>,
    sender_key: SenderKey,
    sender_data: Option<serde_json::Value>,
    adopt_stack_data: Option<serde_json::Value>,
) -> Result<(), ConvergenceError> {
    let key = SyncPointKey::new(next_res_id, traversal_id, is_update);
    let mut new_data = BTreeMap::new();
    new_data.insert(sender_key, sender_data);

    let dispatcher_ref = dispatcher;
    let adopt = adopt_stack_data;
    convergence_syncpoint::sync(
        sync_points,
        key,
        &predecessors,
        Some(new_data),
        None,
        false,
        move |entity_id, merged, _failures, _skip| {
            dispatcher_ref.cast_check_resource(entity_id, traversal_id, merged, is_update, adopt);
        },
    )
    .await
}

/// Marks the stack complete the moment every root of the graph has deposited its completion in
/// the stack-level sync-point `(stack_id, traversal, true)` (spec §4.3.5). A no-op for any sender
/// that isn't itself a root.
pub async fn check_stack_complete<F>(
    sync_points: &dyn SyncPointStore,
    graph: &DependencyGraph,
    stack_id: StackId,
    traversal_id: TraversalId,
    sender_id: ResourceId,
    is_update: bool,
    mark_complete: F,
) -> Result<(), ConvergenceError>
where
    F: FnOnce(),
{
    let roots = graph.roots();
    let sender_node = ConvergenceNode {
        resource_id: sender_id,
        kind: NodeKind::from_is_update(is_update),
        snapshot_id: None,
    };
    if !roots.contains(&sender_node) {
        return Ok(());
    }

    let predecessors: BTreeSet<SenderKey> = roots
        .into_iter()
        .map(|n| SenderKey::new(n.resource_id, n.is_update()))
        .collect();
    let sender_key = SenderKey::new(sender_id, is_update);
    let mut new_data = BTreeMap::new();
    new_data.insert(sender_key, None);

    let key = SyncPointKey::new(stack_id_as_entity(stack_id), traversal_id, true);
    convergence_syncpoint::sync(
        sync_points,
        key,
        &predecessors,
        Some(new_data),
        None,
        false,
        move |_entity_id, _merged, _failures, _skip| mark_complete(),
    )
    .await
}

/// The stack-level sync-point is keyed by the stack's own id rather than a resource id; the
/// store's key type is `i64`-valued, so the stack's UUID is folded into the low 64 bits the same
/// way on every call (collisions across stacks are not a concern: each stack's sync-points are
/// additionally partitioned by `stack_id` in storage).
pub(crate) fn stack_id_as_entity(stack_id: StackId) -> ResourceId {
    let bytes = stack_id.as_u128();
    (bytes & 0xFFFF_FFFF_FFFF_FFFF) as i64
}
