// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `WorkerService`: the `EngineWorker`/`EngineListener` RPC handler (spec §4.5). Dispatches
//! `check_resource` onto a fresh task of the process's `task_executor::Executor`, handles the
//! "this traversal is stale" retrigger path inline (no task needed — it's cheap), and owns
//! `stop_traversal`/`stop_all_workers`, the stack-cancellation operations a stack-operation API
//! calls into this service to perform.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use convergence_checker::propagate::propagate_check_resource;
use convergence_checker::CheckRunner;
use convergence_grpc::client::CancelDispatcher;
use convergence_grpc::{EngineListenerRpc, EngineWorkerRpc};
use convergence_model::{
    ConvergenceError, ConvergenceNode, EngineId, Resource, ResourceId, SenderKey, Stack, StackId,
    TraversalId,
};
use task_executor::Executor;

use crate::cancel::CancellationRegistry;

/// Operator-tunable knobs for `stop_all_workers` (spec §4.5: "Wait up to `CANCEL_RETRIES` × 5s
/// polling until no engines remain locked").
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub cancel_retries: u32,
    pub cancel_retry_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cancel_retries: 3,
            cancel_retry_wait: Duration::from_secs(5),
        }
    }
}

pub struct WorkerService {
    runner: Arc<CheckRunner>,
    cancel_dispatcher: Arc<dyn CancelDispatcher>,
    executor: Executor,
    cancellations: Arc<CancellationRegistry>,
    config: WorkerConfig,
}

impl WorkerService {
    pub fn new(
        runner: Arc<CheckRunner>,
        cancel_dispatcher: Arc<dyn CancelDispatcher>,
        executor: Executor,
        config: WorkerConfig,
    ) -> Self {
        Self {
            runner,
            cancel_dispatcher,
            executor,
            cancellations: Arc::new(CancellationRegistry::new()),
            config,
        }
    }

    /// §4.5's "retrigger_replaced" path: a `check_resource` arrived naming a traversal the stack
    /// has already moved past. If this resource id is itself a replacement, it's dead weight —
    /// mark it for purge — then retrigger whichever of its predecessors/dependents is actually
    /// waiting on the *current* traversal.
    async fn retrigger_replaced(
        &self,
        resource: Resource,
        stack: Stack,
        stale_traversal: TraversalId,
    ) -> Result<(), ConvergenceError> {
        tracing::debug!(
            resource_id = resource.id,
            %stale_traversal,
            current = %stack.current_traversal,
            "check_resource for a superseded traversal; retriggering on the current one"
        );

        let target_id = if let Some(replaces) = resource.replaces {
            self.runner.resources.mark_for_purge(resource.id).await?;
            replaces
        } else {
            resource.id
        };

        self.retrigger_on_latest(target_id, stack.id, stack.current_traversal)
            .await
    }

    /// Looks up `resource_id`'s node in the latest traversal's graph (preferring its update node
    /// if one still exists, else its cleanup node) and propagates an already-arrived signal for
    /// it, matching `CheckRunner::retrigger_check_resource` (spec §4.3.3) — this is the same
    /// operation, just reached from the RPC entry point instead of from inside a running check.
    async fn retrigger_on_latest(
        &self,
        resource_id: ResourceId,
        stack_id: StackId,
        latest_traversal: TraversalId,
    ) -> Result<(), ConvergenceError> {
        let graph = self.runner.graphs.graph_for(stack_id, latest_traversal).await?;

        let update_node = ConvergenceNode::update(resource_id);
        let cleanup_node = ConvergenceNode::cleanup(resource_id);
        let key = if graph.contains(&update_node) {
            update_node
        } else {
            cleanup_node
        };

        let predecessors: BTreeSet<SenderKey> = graph
            .requires(key)
            .into_iter()
            .map(|n| SenderKey::new(n.resource_id, n.is_update()))
            .collect();

        match propagate_check_resource(
            self.runner.sync_points.as_ref(),
            self.runner.dispatcher.as_ref(),
            latest_traversal,
            resource_id,
            key.is_update(),
            predecessors,
            SenderKey::new(key.resource_id, key.is_update()),
            None,
            None,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(ConvergenceError::NotFound(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// §4.5: bump `stack.current_traversal` to a fresh id (CAS'd), mark the stack `FAILED` with
    /// a cancellation reason, purge the old traversal's sync-points, and recurse into any
    /// descendant nested stack still in progress.
    pub async fn stop_traversal(&self, stack_id: StackId) -> Result<(), ConvergenceError> {
        let stack = self.runner.stacks.get(stack_id).await?;
        let new_traversal = uuid::Uuid::new_v4();

        let updated = self
            .runner
            .stacks
            .update_traversal(stack_id, stack.current_traversal, new_traversal)
            .await?;
        if !updated {
            tracing::debug!(%stack_id, "stop_traversal lost the CAS race, traversal already moved on");
            return Ok(());
        }

        let reason = format!("Stack {:?} cancelled", stack.action);
        if !self.runner.stacks.mark_failed(stack_id, new_traversal, reason).await? {
            tracing::debug!(%stack_id, "stop_traversal's mark_failed lost the CAS race, traversal already moved on again");
        }
        self.runner.sync_points.delete_all(stack_id, stack.current_traversal).await?;

        for child in self.runner.stacks.children_in_progress(stack_id).await? {
            Box::pin(self.stop_traversal(child.id)).await?;
        }
        Ok(())
    }

    /// §4.5: fan out `cancel_check_resource` to every engine currently holding a lock on this
    /// stack; poll until none remain locked or `cancel_retries` is exhausted.
    pub async fn stop_all_workers(&self, stack_id: StackId) -> Result<(), ConvergenceError> {
        for attempt in 0..self.config.cancel_retries {
            let engines = self
                .runner
                .stacks
                .engine_get_all_locked_by_stack(stack_id)
                .await?;
            if engines.is_empty() {
                return Ok(());
            }
            tracing::debug!(%stack_id, attempt, holders = engines.len(), "casting cancel_check_resource");
            for engine_id in engines {
                self.cancel_dispatcher.cast_cancel_check_resource(stack_id, engine_id);
            }
            tokio::time::sleep(self.config.cancel_retry_wait).await;
        }

        let remaining = self
            .runner
            .stacks
            .engine_get_all_locked_by_stack(stack_id)
            .await?;
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(ConvergenceError::Other(format!(
                "stop_all_workers: {} engine(s) still locked on stack {stack_id} after {} retries",
                remaining.len(),
                self.config.cancel_retries
            )))
        }
    }
}

#[async_trait]
impl EngineWorkerRpc for WorkerService {
    async fn check_resource(
        &self,
        resource_id: ResourceId,
        current_traversal: TraversalId,
        data: std::collections::BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        adopt_stack_data: Option<serde_json::Value>,
        converge: bool,
    ) -> Result<(), ConvergenceError> {
        let resource = self.runner.resources.get(resource_id).await?;
        let stack = self.runner.stacks.get(resource.stack_id).await?;

        if current_traversal != stack.current_traversal {
            return self.retrigger_replaced(resource, stack, current_traversal).await;
        }

        tracing::debug!(resource_id, is_update, converge, "scheduling check_resource task");

        let (token, cancel_id) = self.cancellations.register(stack.id);
        let registry = self.cancellations.clone();
        let runner = self.runner.clone();
        let stack_id = stack.id;
        self.executor.native_spawn(async move {
            if let Err(e) = runner
                .check(resource_id, current_traversal, data, is_update, adopt_stack_data, &token)
                .await
            {
                tracing::warn!(resource_id, error = %e, "check_resource task exited with an error");
            }
            registry.deregister(stack_id, cancel_id);
        });

        Ok(())
    }

    async fn cancel_check_resource(
        &self,
        stack_id: StackId,
        engine_id: EngineId,
    ) -> Result<(), ConvergenceError> {
        tracing::info!(%stack_id, %engine_id, "cancel_check_resource received");
        self.cancellations.cancel_all(stack_id);
        Ok(())
    }
}

#[async_trait]
impl EngineListenerRpc for WorkerService {
    async fn listening(&self) -> bool {
        true
    }
}
