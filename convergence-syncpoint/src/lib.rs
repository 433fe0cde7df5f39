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

//! Rendezvous records for dependency convergence (spec §4.1/§4.3.4). A sync point accumulates
//! the attribute payloads sent by a node's predecessors and, once every predecessor has reported,
//! triggers exactly one propagation to the node's dependents. Because many predecessors can
//! finish concurrently, the store update is a compare-and-swap on `atomic_key`; contention is
//! handled with randomized exponential backoff rather than blocking.

pub mod memory;
pub mod pg;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use convergence_model::{
    ConvergenceError, ResourceId, SenderKey, StackId, SyncPoint, SyncPointExtra, SyncPointKey,
    TraversalId,
};

/// Storage seam for sync-point rows. A Postgres-backed implementation lives in
/// `convergence-store`; `memory::InMemorySyncPointStore` here backs the unit tests in this crate
/// and the checker/worker integration tests.
#[async_trait]
pub trait SyncPointStore: Send + Sync {
    async fn create(&self, stack_id: StackId, key: SyncPointKey) -> Result<(), ConvergenceError>;

    async fn get(&self, key: SyncPointKey) -> Result<SyncPoint, ConvergenceError>;

    async fn delete_all(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
    ) -> Result<(), ConvergenceError>;

    /// Applies the CAS update: succeeds (returning `true`) only if the row's current
    /// `atomic_key` still equals `expected_atomic_key`, in which case it is bumped by one.
    /// Returns `false` on a conflicting concurrent writer and `Ok` with no error — the caller
    /// retries. A missing row (deleted by a superseding traversal) surfaces as `NotFound`.
    async fn update_input_data(
        &self,
        key: SyncPointKey,
        expected_atomic_key: i64,
        input_data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        extra_data: SyncPointExtra,
    ) -> Result<bool, ConvergenceError>;
}

/// 10ms of extra jitter per outstanding predecessor beyond the first, capped at 10s total —
/// mirrors the original engine's `init_jitter`.
fn init_jitter(predecessors: &BTreeSet<SenderKey>, existing_input_data_len: usize) -> f64 {
    let nconflicts = (predecessors.len() as i64 - existing_input_data_len as i64 - 1).max(0);
    (nconflicts.min(1000) as f64) * 0.01
}

/// Picks a random wait in `[0, min(60s, multiplier * 2^attempt))`, matching
/// `tenacity.wait_random_exponential(max=60)` with a per-attempt dynamic multiplier.
fn next_wait(multiplier: f64, attempt: u32) -> Duration {
    let ceiling = (multiplier * 2f64.powi(attempt as i32)).min(60.0).max(0.0);
    let secs = rand::thread_rng().gen_range(0.0..=ceiling.max(f64::EPSILON));
    Duration::from_secs_f64(secs)
}

/// The result of a successful `update_sync_point` call: the accumulated input data, the
/// accumulated per-sender failure reasons, and whether propagation should be suppressed
/// regardless of readiness (used when a resource higher up the graph already failed and the
/// traversal is winding down without doing further work).
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    pub input_data: BTreeMap<SenderKey, Option<serde_json::Value>>,
    pub resource_failures: BTreeMap<SenderKey, String>,
    pub skip_propagate: bool,
    /// True only if this call observed the not-ready-to-ready transition for `predecessors` —
    /// i.e. at least one predecessor key was missing before this update and all are present
    /// after. A caller re-delivering a contribution that was already satisfied sees `false`, so
    /// `propagate_cb` fires at most once per sync point (testable property in spec §8).
    newly_ready: bool,
}

/// Atomically merges `new_data`/`new_resource_failures` into the sync point named by `key`,
/// retrying on CAS conflicts with jittered exponential backoff. Returns `None` if the sync point
/// was deleted out from under the update — the normal signal that a newer traversal superseded
/// this one, not an error.
pub async fn update_sync_point(
    store: &dyn SyncPointStore,
    key: SyncPointKey,
    predecessors: &BTreeSet<SenderKey>,
    new_data: Option<BTreeMap<SenderKey, Option<serde_json::Value>>>,
    new_resource_failures: Option<BTreeMap<SenderKey, String>>,
    is_skip: bool,
) -> Result<Option<SyncUpdate>, ConvergenceError> {
    let mut attempt: u32 = 0;
    loop {
        let sync_point = match store.get(key).await {
            Ok(sp) => sp,
            Err(ConvergenceError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let was_ready = predecessors
            .iter()
            .all(|p| sync_point.input_data.contains_key(p));

        let mut input_data = sync_point.input_data.clone();
        let mut resource_failures = sync_point.extra_data.resource_failures.clone();
        let mut skip_propagate = sync_point.extra_data.skip_propagate;

        if let Some(ref failures) = new_resource_failures {
            resource_failures.extend(failures.clone());
        }
        if is_skip {
            skip_propagate = true;
        }

        let multiplier = init_jitter(predecessors, input_data.len());

        if let Some(ref data) = new_data {
            input_data.extend(data.clone());
        }

        let extra_data = SyncPointExtra {
            resource_failures: resource_failures.clone(),
            skip_propagate,
        };

        let applied = store
            .update_input_data(key, sync_point.atomic_key, input_data.clone(), extra_data)
            .await?;

        if applied {
            let now_ready = predecessors.iter().all(|p| input_data.contains_key(p));
            return Ok(Some(SyncUpdate {
                input_data,
                resource_failures,
                skip_propagate,
                newly_ready: now_ready && !was_ready,
            }));
        }

        let wait = next_wait(multiplier, attempt);
        attempt += 1;
        tracing::trace!(?key, attempt, ?wait, "sync point CAS conflict, retrying");
        tokio::time::sleep(wait).await;
    }
}

/// Updates the sync point and, the moment every predecessor in `predecessors` has reported,
/// invokes `propagate` exactly once with the accumulated data. `propagate` is never called more
/// than once per sync point because the CAS guarantees only one writer observes the
/// not-ready-to-ready transition.
pub async fn sync<F>(
    store: &dyn SyncPointStore,
    key: SyncPointKey,
    predecessors: &BTreeSet<SenderKey>,
    new_data: Option<BTreeMap<SenderKey, Option<serde_json::Value>>>,
    new_resource_failures: Option<BTreeMap<SenderKey, String>>,
    is_skip: bool,
    propagate: F,
) -> Result<(), ConvergenceError>
where
    F: FnOnce(ResourceId, BTreeMap<SenderKey, Option<serde_json::Value>>, BTreeMap<SenderKey, String>, bool),
{
    let Some(update) = update_sync_point(
        store,
        key,
        predecessors,
        new_data,
        new_resource_failures,
        is_skip,
    )
    .await?
    else {
        tracing::warn!(?key, "sync point update failed: no longer present");
        return Ok(());
    };

    if update.newly_ready {
        tracing::debug!(?key, "sync point ready, propagating");
        propagate(
            key.entity_id,
            update.input_data,
            update.resource_failures,
            update.skip_propagate,
        );
    } else {
        let waiting: BTreeSet<SenderKey> = predecessors
            .iter()
            .filter(|p| !update.input_data.contains_key(*p))
            .copied()
            .collect();
        if waiting.is_empty() {
            tracing::debug!(?key, "sync point already satisfied, not re-propagating");
        } else {
            tracing::debug!(?key, ?waiting, "sync point still waiting on predecessors");
        }
    }

    Ok(())
}
