// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Trait seams the Check-Runner depends on but this crate never implements for real: loading a
//! driver for a resource, the graph a traversal is executing over, dispatching the next RPC, and
//! asking a peer engine whether it's still alive. `convergence-worker` supplies production
//! implementations; `tests.rs` here supplies in-memory ones for the end-to-end scenarios of
//! spec §8.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use convergence_graph::DependencyGraph;
use convergence_model::{
    ConvergenceError, EngineId, ResourceDriver, ResourceId, SenderKey, Stack, StackId, TraversalId,
};

/// Resolves the dependency graph a traversal is executing over. The graph itself is built by the
/// (out-of-scope) template compiler; this crate only ever reads it.
#[async_trait]
pub trait GraphProvider: Send + Sync {
    async fn graph_for(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
    ) -> Result<Arc<DependencyGraph>, ConvergenceError>;
}

/// Produces the capability-set object (§9 "Dynamic dispatch across many resource types") for a
/// resource id. The core never matches on concrete resource types; it only ever calls through
/// this trait and the `ResourceDriver` it returns.
#[async_trait]
pub trait ResourceDriverFactory: Send + Sync {
    async fn load(&self, resource_id: ResourceId) -> Result<Box<dyn ResourceDriver>, ConvergenceError>;
}

/// Fire-and-forget dispatch of the next `check_resource` RPC (spec §4.4: "cast ... over the
/// topic — any engine may pick it up"). The caller never awaits completion of the dispatched
/// work, only that the message was accepted.
pub trait CheckResourceDispatcher: Send + Sync {
    fn cast_check_resource(
        &self,
        resource_id: ResourceId,
        traversal_id: TraversalId,
        data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        adopt_stack_data: Option<serde_json::Value>,
    );
}

/// The `EngineListener` liveness probe (spec §4.5) consulted during stale-lock retry (§4.3.2).
#[async_trait]
pub trait EngineLiveness: Send + Sync {
    async fn is_alive(&self, engine_id: EngineId) -> bool;
}

/// Kicks off the rollback traversal once `handle_resource_failure` has CAS'd `stack` into
/// `ROLLBACK(IN_PROGRESS)` targeting `new_traversal` (spec §4.4 state machine: "resource failure
/// + !disable_rollback -> ROLLBACK(IN_PROGRESS)"). Building the rollback graph from
/// `stack.raw_template_id` (now the previously-good template) and seeding its sync points and
/// initial `check_resource` casts is the same out-of-scope template-compiler/stack-operation-API
/// job `GraphStore::put`'s doc comment describes for any other freshly-started traversal — this
/// crate only needs to decide *that* a rollback should start, never how to render one.
#[async_trait]
pub trait RollbackStarter: Send + Sync {
    async fn start_rollback(&self, stack: Stack, new_traversal: TraversalId) -> Result<(), ConvergenceError>;
}
