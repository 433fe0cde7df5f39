// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
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

//! Persistence for the three tables the core reads/writes (spec §6): `resource`, `stack`, and
//! (in `convergence-syncpoint`) `sync_point`. `pg` holds the `sqlx`/Postgres-backed
//! implementation used in production; `memory` holds a test double with the same CAS semantics,
//! used by `convergence-checker`'s integration tests.

pub mod memory;
pub mod pg;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;

use convergence_model::{
    AttributeValue, ConvergenceError, EngineId, ResourceAction, ResourceId, ResourceStatus, Stack,
    StackId, TraversalId,
};

/// The data a successful driver completion writes back to the resource row in one atomic step.
#[derive(Debug, Clone)]
pub struct ResourceCompletion {
    pub action: ResourceAction,
    pub status: ResourceStatus,
    pub status_reason: String,
    pub current_template_id: String,
    pub uuid: uuid::Uuid,
    pub reference_id: Option<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub requires: BTreeSet<ResourceId>,
}

/// Persistence for `resource` rows (spec §3/§6). Every mutating method is CAS-guarded on
/// `engine_id` or `current_template_id` as described in spec §4.3/§5 — callers never issue a
/// blind write.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, id: ResourceId) -> Result<convergence_model::Resource, ConvergenceError>;

    /// CAS-acquire the per-resource lock: succeeds only if `engine_id` is currently `NULL` or
    /// already equal to `engine_id`. Fails with `UpdateInProgress` naming the current holder
    /// otherwise.
    async fn acquire_lock(
        &self,
        id: ResourceId,
        engine_id: EngineId,
    ) -> Result<convergence_model::Resource, ConvergenceError>;

    /// Writes a successful completion and releases the lock in one step (current_template_id
    /// transition, invariant 4).
    async fn complete(
        &self,
        id: ResourceId,
        engine_id: EngineId,
        completion: ResourceCompletion,
    ) -> Result<(), ConvergenceError>;

    /// Marks the resource failed and releases the lock. Used both by the normal
    /// `ResourceFailure`/`Timeout` path and by lock-stealing (§4.3.2).
    async fn mark_failed(
        &self,
        id: ResourceId,
        engine_id: EngineId,
        action: ResourceAction,
        reason: String,
    ) -> Result<(), ConvergenceError>;

    /// Lock steal: clears `engine_id` only if it still equals `dead_engine_id`, and marks the
    /// row failed with the supplied reason. A no-op success if the row has already moved on.
    async fn steal_lock(
        &self,
        id: ResourceId,
        dead_engine_id: EngineId,
        action: ResourceAction,
        reason: String,
    ) -> Result<(), ConvergenceError>;

    /// Atomically creates a replacement row with `replaces = id`. `Ok(None)` means a newer
    /// traversal already replaced this resource (give up quietly); `UpdateInProgress` means a
    /// concurrent replacement is racing this one.
    async fn create_replacement(
        &self,
        id: ResourceId,
        new_template_id: String,
        requires: BTreeSet<ResourceId>,
    ) -> Result<Option<ResourceId>, ConvergenceError>;

    /// Unconditionally marks a resource `DELETE` so a later purge pass reaps it. Used by the
    /// Worker Service's replaced-on-a-superseded-traversal path (spec §4.5): a `check_resource`
    /// arrives for a resource id that is itself a replacement no longer present in the current
    /// graph, and the row just needs to be flagged for cleanup rather than driven through the
    /// normal lock/complete lifecycle.
    async fn mark_for_purge(&self, id: ResourceId) -> Result<(), ConvergenceError>;
}

/// Persistence for `stack` rows.
#[async_trait]
pub trait StackStore: Send + Sync {
    async fn get(&self, id: StackId) -> Result<Stack, ConvergenceError>;

    /// CAS-bump `current_traversal`: succeeds only if the row's current value still equals
    /// `expected`. Used by `stop_traversal` (spec §4.5) — the stack-level lock.
    async fn update_traversal(
        &self,
        id: StackId,
        expected: TraversalId,
        new_traversal: TraversalId,
    ) -> Result<bool, ConvergenceError>;

    /// CAS-guarded on `current_traversal` (spec §6: "`select_and_update` with expected prior
    /// `current_traversal` is required" for the stack table) — succeeds only if the row's
    /// `current_traversal` still equals `expected_traversal`. Returns `false` without writing
    /// when it doesn't: a newer traversal has already superseded this one, and the caller's
    /// retrigger path (spec §4.3: "If stack was not in fact marked ... retrigger the current node
    /// on the latest traversal") is what's supposed to run instead.
    async fn mark_failed(
        &self,
        id: StackId,
        expected_traversal: TraversalId,
        reason: String,
    ) -> Result<bool, ConvergenceError>;

    /// Same CAS guard as `mark_failed`: a stale completion signal from a superseded traversal
    /// must not stomp a stack that has since failed or moved on to a new traversal.
    async fn mark_complete(
        &self,
        id: StackId,
        expected_traversal: TraversalId,
    ) -> Result<bool, ConvergenceError>;

    /// CAS-guarded on `current_traversal`: swaps the stack onto a fresh traversal targeting the
    /// previously-good template instead of leaving it `FAILED` (spec §4.4 state machine:
    /// `IN_PROGRESS` + "resource failure + !disable_rollback" -> `ROLLBACK(IN_PROGRESS)`).
    /// `raw_template_id`/`prev_raw_template_id` are swapped in the same write so the rollback
    /// traversal renders against the old template and a second failed rollback would swap back.
    /// Returns `false` without writing if `expected_traversal` no longer matches.
    async fn start_rollback(
        &self,
        id: StackId,
        expected_traversal: TraversalId,
        new_traversal: TraversalId,
        reason: String,
    ) -> Result<bool, ConvergenceError>;

    /// Every distinct `engine_id` currently holding a lock on any resource belonging to this
    /// stack — used by `stop_all_workers` to know who to cancel.
    async fn engine_get_all_locked_by_stack(
        &self,
        stack_id: StackId,
    ) -> Result<Vec<EngineId>, ConvergenceError>;

    /// Nested stacks still `IN_PROGRESS` rooted at `root_stack_id`, for the recursive
    /// `stop_traversal` descent over child stacks.
    async fn children_in_progress(
        &self,
        root_stack_id: StackId,
    ) -> Result<Vec<Stack>, ConvergenceError>;
}
