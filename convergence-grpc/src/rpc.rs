// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The handler traits `server` adapts `tonic`'s generated service traits onto. A worker process
//! (`convergence-worker`) implements these in domain terms; `server` is the only place that
//! knows about wire types.

use std::collections::BTreeMap;

use async_trait::async_trait;

use convergence_model::{ConvergenceError, EngineId, ResourceId, SenderKey, StackId, TraversalId};

/// Domain-level handler for the `EngineWorker` service (spec §4.5/§6).
#[async_trait]
pub trait EngineWorkerRpc: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn check_resource(
        &self,
        resource_id: ResourceId,
        current_traversal: TraversalId,
        data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        adopt_stack_data: Option<serde_json::Value>,
        converge: bool,
    ) -> Result<(), ConvergenceError>;

    async fn cancel_check_resource(
        &self,
        stack_id: StackId,
        engine_id: EngineId,
    ) -> Result<(), ConvergenceError>;
}

/// Domain-level handler for the companion `EngineListener` service (spec §4.5), hosted on its
/// own bind address so liveness checks are serviced even when `EngineWorker`'s thread-group is
/// saturated.
#[async_trait]
pub trait EngineListenerRpc: Send + Sync {
    async fn listening(&self) -> bool;
}
