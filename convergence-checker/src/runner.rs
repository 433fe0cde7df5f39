// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Resource Check-Runner (spec §4.3): given a node in the dependency graph, invokes the
//! driver, interprets its outcome, and either propagates to successors or recovers (stale lock
//! retry, replacement, retrigger on a superseded traversal).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use convergence_model::{
    CancellationToken, ConvergenceError, EngineId, Resource, ResourceAction, ResourceId,
    SenderKey, StackId, TraversalId,
};
use convergence_store::{ResourceCompletion, ResourceStore, StackStore};
use convergence_syncpoint::SyncPointStore;
use convergence_telemetry::SharedMetrics;

use crate::propagate::{check_stack_complete, propagate_check_resource, propagate_on_success};
use crate::seams::{CheckResourceDispatcher, EngineLiveness, GraphProvider, ResourceDriverFactory, RollbackStarter};

/// Timings the runner needs that are otherwise operator configuration (`convergence-config`
/// owns the authoritative defaults; this struct is what actually gets threaded through).
#[derive(Debug, Clone, Copy)]
pub struct CheckerConfig {
    /// How long to wait for an `EngineListener.listening()` reply before declaring a lock
    /// holder dead (§4.3.2).
    pub engine_life_check_timeout: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            engine_life_check_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything the Check-Runner needs to process one node: the three stores, the graph provider,
/// the driver factory, the outbound dispatcher, and the peer-liveness probe. Constructed once
/// per engine process and shared across every concurrently running `check_resource` task.
pub struct CheckRunner {
    pub engine_id: EngineId,
    pub resources: Arc<dyn ResourceStore>,
    pub stacks: Arc<dyn StackStore>,
    pub sync_points: Arc<dyn SyncPointStore>,
    pub graphs: Arc<dyn GraphProvider>,
    pub drivers: Arc<dyn ResourceDriverFactory>,
    pub dispatcher: Arc<dyn CheckResourceDispatcher>,
    pub liveness: Arc<dyn EngineLiveness>,
    pub rollback: Arc<dyn RollbackStarter>,
    pub config: CheckerConfig,
    /// Optional so test doubles can skip wiring a registry; production always supplies one.
    pub metrics: Option<SharedMetrics>,
}

impl CheckRunner {
    /// Processes one `(resource_id, is_update)` node (spec §4.3's `check`). Preconditions — the
    /// resource row exists and `stack.current_traversal == current_traversal` — are normally
    /// already established by the Worker Service before this is called; they are re-verified
    /// here defensively since the resource/stack rows may have moved on by the time this task
    /// actually runs.
    pub async fn check(
        &self,
        resource_id: ResourceId,
        current_traversal: TraversalId,
        resource_data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        adopt_stack_data: Option<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<(), ConvergenceError> {
        if let Some(metrics) = &self.metrics {
            metrics
                .nodes_checked
                .with_label_values(&[if is_update { "true" } else { "false" }])
                .inc();
        }

        let resource = self.resources.get(resource_id).await?;
        let stack = self.stacks.get(resource.stack_id).await?;

        if stack.current_traversal != current_traversal {
            tracing::debug!(resource_id, %current_traversal, "stale check_resource for a superseded traversal, ignoring");
            return Ok(());
        }

        let now = Utc::now();
        if stack.has_timed_out(now) {
            tracing::warn!(stack_id = %stack.id, "stack timed out while resource {resource_id} was in progress");
            if self
                .stacks
                .mark_failed(stack.id, current_traversal, "Timed out".to_string())
                .await?
            {
                self.record_stack_outcome(stack.action, "FAILED");
            }
            return Ok(());
        }

        let prev_template_id = resource.current_template_id.clone();

        match self
            .do_check_resource(
                &resource,
                &resource_data,
                is_update,
                current_traversal,
                &stack.raw_template_id,
                stack.time_remaining(now),
                adopt_stack_data.clone(),
                cancel,
            )
            .await
        {
            Ok(true) => {
                let graph = self.graphs.graph_for(stack.id, current_traversal).await?;
                let completed = self.resources.get(resource_id).await?;
                propagate_on_success(
                    self.sync_points.as_ref(),
                    self.dispatcher.as_ref(),
                    graph.as_ref(),
                    current_traversal,
                    &completed,
                    is_update,
                    adopt_stack_data,
                )
                .await?;
                let stack_completed = std::sync::atomic::AtomicBool::new(false);
                check_stack_complete(
                    self.sync_points.as_ref(),
                    graph.as_ref(),
                    stack.id,
                    current_traversal,
                    resource_id,
                    is_update,
                    || stack_completed.store(true, std::sync::atomic::Ordering::Release),
                )
                .await?;
                if stack_completed.load(std::sync::atomic::Ordering::Acquire)
                    && self.stacks.mark_complete(stack.id, current_traversal).await?
                {
                    self.record_stack_outcome(stack.action, "COMPLETE");
                }
                Ok(())
            }
            // Replacement was already handled (cast to the new id, or quietly given up); never
            // propagate from the node that triggered it.
            Ok(false) => Ok(()),
            Err(ConvergenceError::UpdateInProgress { .. }) => {
                if self
                    .stale_resource_needs_retry(resource_id, &prev_template_id)
                    .await?
                {
                    self.dispatcher.cast_check_resource(
                        resource_id,
                        current_traversal,
                        resource_data,
                        is_update,
                        adopt_stack_data,
                    );
                }
                Ok(())
            }
            Err(ConvergenceError::ResourceFailure { reason, action }) => {
                let message = format!("Resource {action:?} failed: {reason}");
                self.handle_resource_failure(resource_id, &resource, is_update, &stack.id, current_traversal, message)
                    .await
            }
            Err(ConvergenceError::Timeout) => {
                self.handle_resource_failure(
                    resource_id,
                    &resource,
                    is_update,
                    &stack.id,
                    current_traversal,
                    "Timed out".to_string(),
                )
                .await
            }
            Err(ConvergenceError::CancelOperation) => {
                // The canceller already marked the stack FAILED; only retrigger in case a new
                // traversal is waiting on us.
                self.retrigger_new_traversal(resource_id, stack.id, current_traversal)
                    .await
            }
            Err(other) => {
                let message = other.to_string();
                let _ = self
                    .resources
                    .mark_failed(resource_id, self.engine_id, resource.action, message.clone())
                    .await;
                let _ = self.stacks.mark_failed(stack.id, current_traversal, message).await;
                Err(other)
            }
        }
    }

    /// Acquires the lock and invokes the driver. Returns `Ok(true)` on a successful
    /// create/update/delete, `Ok(false)` if the node resolved into a replacement and must not
    /// propagate, or `Err` for every other driver outcome (handled by the caller).
    #[allow(clippy::too_many_arguments)]
    async fn do_check_resource(
        &self,
        resource: &Resource,
        resource_data: &BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        current_traversal: TraversalId,
        template_id: &str,
        time_remaining: Duration,
        adopt_stack_data: Option<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<bool, ConvergenceError> {
        self.resources.acquire_lock(resource.id, self.engine_id).await?;
        let mut driver = self.drivers.load(resource.id).await?;

        if is_update {
            let requires: BTreeSet<ResourceId> = resource_data
                .keys()
                .filter(|k| resource_data[k].is_some())
                .map(|k| k.resource_id)
                .collect();

            let result = match resource.action {
                ResourceAction::Init => {
                    driver
                        .create_convergence(template_id, requires.clone(), self.engine_id, time_remaining, cancel)
                        .await
                }
                _ => {
                    driver
                        .update_convergence(template_id, requires.clone(), self.engine_id, time_remaining, cancel)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    self.write_completion(resource.id, &*driver, Some(template_id)).await?;
                    Ok(true)
                }
                Err(ConvergenceError::UpdateReplace { new_template_id, requires: replace_requires }) => {
                    self.handle_resource_replacement(
                        &mut *driver,
                        resource,
                        &new_template_id,
                        replace_requires.into_iter().collect(),
                        current_traversal,
                        resource_data,
                        is_update,
                        adopt_stack_data,
                    )
                    .await?;
                    Ok(false)
                }
                Err(other) => Err(other),
            }
        } else {
            driver
                .delete_convergence(template_id, self.engine_id, time_remaining, cancel)
                .await?;
            self.write_completion(resource.id, &*driver, None).await?;
            Ok(true)
        }
    }

    async fn write_completion(
        &self,
        resource_id: ResourceId,
        driver: &dyn convergence_model::ResourceDriver,
        new_template_id: Option<&str>,
    ) -> Result<(), ConvergenceError> {
        let node_data = driver.node_data();
        let completion = ResourceCompletion {
            action: node_data.action,
            status: convergence_model::ResourceStatus::Complete,
            status_reason: String::new(),
            current_template_id: new_template_id
                .map(ToString::to_string)
                .unwrap_or_else(|| driver.current_template_id().to_string()),
            uuid: node_data.uuid,
            reference_id: node_data.reference_id,
            attributes: node_data.attributes,
            requires: BTreeSet::new(),
        };
        self.resources.complete(resource_id, self.engine_id, completion).await
    }

    /// §4.3.1: create a replacement row and cast its `check_resource` on the current traversal.
    /// Never blocks on the replacement's own completion.
    #[allow(clippy::too_many_arguments)]
    async fn handle_resource_replacement(
        &self,
        driver: &mut dyn convergence_model::ResourceDriver,
        resource: &Resource,
        new_template_id: &str,
        requires: BTreeSet<ResourceId>,
        current_traversal: TraversalId,
        resource_data: &BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        adopt_stack_data: Option<serde_json::Value>,
    ) -> Result<(), ConvergenceError> {
        match driver.make_replacement(new_template_id, requires).await {
            Ok(Some(new_id)) => {
                tracing::info!(old = resource.id, new = new_id, "replacing resource");
                if let Some(metrics) = &self.metrics {
                    metrics.replacements_created.with_label_values(&["driver_requested"]).inc();
                }
                self.dispatcher.cast_check_resource(
                    new_id,
                    current_traversal,
                    resource_data.clone(),
                    is_update,
                    adopt_stack_data,
                );
                Ok(())
            }
            Ok(None) => {
                tracing::info!(resource_id = resource.id, "no replacement created - new traversal already in progress");
                self.retrigger_new_traversal(resource.id, resource.stack_id, current_traversal)
                    .await
            }
            Err(ConvergenceError::UpdateInProgress { .. }) => {
                tracing::info!(resource_id = resource.id, "no replacement created - resource already locked by new traversal");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// §4.3.2: determine whether a failed lock-acquire should be retried. Three cases: the
    /// holder is a dead peer (steal the lock and retry), the lock was simply released between
    /// our read and our CAS (retry), or the resource has moved on under a concurrent traversal
    /// (give up).
    async fn stale_resource_needs_retry(
        &self,
        resource_id: ResourceId,
        prev_template_id: &str,
    ) -> Result<bool, ConvergenceError> {
        let fresh = self.resources.get(resource_id).await?;
        match fresh.engine_id {
            Some(holder) if holder != self.engine_id => {
                let alive = tokio::time::timeout(self.config.engine_life_check_timeout, self.liveness.is_alive(holder))
                    .await
                    .unwrap_or(false);
                if !alive {
                    let reason = format!("Worker went down during resource {:?}", fresh.action);
                    self.resources
                        .steal_lock(resource_id, holder, fresh.action, reason)
                        .await?;
                    if let Some(metrics) = &self.metrics {
                        metrics.lock_steals.with_label_values(&["peer_unresponsive"]).inc();
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None if fresh.current_template_id == prev_template_id => {
                tracing::debug!(resource_id, "resource stale; retrying check");
                Ok(true)
            }
            _ => {
                tracing::debug!(resource_id, "resource modified by another traversal");
                Ok(false)
            }
        }
    }

    /// §4.3's `ResourceFailure`/`Timeout` handling: mark the resource failed, then either start
    /// rollback (spec §4.4: `IN_PROGRESS` + "resource failure + !disable_rollback" ->
    /// `ROLLBACK(IN_PROGRESS)`) or mark the stack failed outright (`disable_rollback`, or the
    /// failure happened during a rollback traversal itself — there is no further template to roll
    /// back to). Both writes are CAS'd on `current_traversal`; if the stack has already moved to a
    /// new traversal, retrigger this node there instead.
    async fn handle_resource_failure(
        &self,
        resource_id: ResourceId,
        resource: &Resource,
        is_update: bool,
        stack_id: &StackId,
        current_traversal: TraversalId,
        reason: String,
    ) -> Result<(), ConvergenceError> {
        let _ = self
            .resources
            .mark_failed(resource_id, self.engine_id, resource.action, reason.clone())
            .await;

        let stack = self.stacks.get(*stack_id).await?;
        let should_roll_back = stack.current_traversal == current_traversal
            && stack.action != ResourceAction::Rollback
            && !stack.disable_rollback;

        if should_roll_back {
            let new_traversal = uuid::Uuid::new_v4();
            if self
                .stacks
                .start_rollback(*stack_id, current_traversal, new_traversal, reason.clone())
                .await?
            {
                self.record_stack_outcome(stack.action, "ROLLBACK");
                let rolled_back = self.stacks.get(*stack_id).await?;
                self.rollback.start_rollback(rolled_back, new_traversal).await?;
                return Ok(());
            }
        }

        let marked = self.stacks.mark_failed(*stack_id, current_traversal, reason).await?;
        if marked {
            self.record_stack_outcome(resource.action, "FAILED");
        }

        let latest_stack = self.stacks.get(*stack_id).await?;
        if latest_stack.current_traversal != current_traversal {
            self.retrigger_check_resource(resource_id, *stack_id, latest_stack.current_traversal)
                .await?;
        }
        Ok(())
    }

    /// §4.3.3: reload the stack; if its traversal has moved on, retrigger this node there.
    async fn retrigger_new_traversal(
        &self,
        resource_id: ResourceId,
        stack_id: StackId,
        current_traversal: TraversalId,
    ) -> Result<(), ConvergenceError> {
        let latest_stack = self.stacks.get(stack_id).await?;
        if current_traversal != latest_stack.current_traversal {
            self.retrigger_check_resource(resource_id, stack_id, latest_stack.current_traversal)
                .await?;
        }
        Ok(())
    }

    /// Looks up this resource's node in the *latest* traversal's graph and propagates an
    /// already-arrived signal for it, so a new traversal waiting on this resource's old
    /// direction can proceed without re-running the driver. The latest graph, not the node kind
    /// the stale signal arrived for, decides which direction this resource now needs: prefer its
    /// update node if the new graph still has one, otherwise it's waiting on cleanup.
    async fn retrigger_check_resource(
        &self,
        resource_id: ResourceId,
        stack_id: StackId,
        latest_traversal: TraversalId,
    ) -> Result<(), ConvergenceError> {
        let graph = self.graphs.graph_for(stack_id, latest_traversal).await?;

        let update_node = convergence_model::ConvergenceNode::update(resource_id);
        let cleanup_node = convergence_model::ConvergenceNode::cleanup(resource_id);
        let key = if graph.contains(&update_node) { update_node } else { cleanup_node };

        tracing::info!(resource_id, key = %key, "re-triggering resource");

        let predecessors: BTreeSet<SenderKey> = graph
            .requires(key)
            .into_iter()
            .map(|n| SenderKey::new(n.resource_id, n.is_update()))
            .collect();

        match propagate_check_resource(
            self.sync_points.as_ref(),
            self.dispatcher.as_ref(),
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

    /// Records a terminal stack status against `convergence_stack_outcomes_total`. A no-op when
    /// no metrics registry was wired in (test doubles commonly omit one).
    fn record_stack_outcome(&self, action: ResourceAction, status: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .stack_outcomes
                .with_label_values(&[&format!("{action:?}").to_uppercase(), status])
                .inc();
        }
    }
}
