// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Coverage for the parts of `WorkerService` that aren't already exercised by
//! `convergence-checker`'s end-to-end scenarios: the stale-traversal retrigger path and the two
//! stack-cancellation operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use convergence_checker::{CheckRunner, CheckerConfig};
use convergence_checker::{CheckResourceDispatcher, EngineLiveness, GraphProvider, ResourceDriverFactory, RollbackStarter};
use convergence_grpc::client::CancelDispatcher;
use convergence_grpc::EngineWorkerRpc;
use convergence_graph::DependencyGraph;
use convergence_model::{
    ConvergenceError, ConvergenceNode, EngineId, Resource, ResourceAction, ResourceDriver,
    ResourceId, ResourceStatus, SenderKey, Stack, StackId, StackStatus, TraversalId,
};
use convergence_store::memory::InMemoryStore;
use convergence_store::StackStore as _;
use convergence_syncpoint::memory::InMemorySyncPointStore;

use crate::graph_store::{GraphStore, InMemoryGraphStore};
use crate::service::{WorkerConfig, WorkerService};

fn sample_resource(id: ResourceId, stack_id: StackId) -> Resource {
    Resource {
        id,
        stack_id,
        uuid: Uuid::new_v4(),
        name: format!("r{id}"),
        action: ResourceAction::Init,
        status: ResourceStatus::InProgress,
        status_reason: String::new(),
        current_template_id: String::new(),
        engine_id: None,
        replaces: None,
        replaced_by: None,
        requires: BTreeSet::new(),
        attributes: BTreeMap::new(),
        reference_id: None,
    }
}

fn sample_stack(id: StackId, traversal: TraversalId) -> Stack {
    Stack {
        id,
        name: "s".to_string(),
        action: ResourceAction::Create,
        status: StackStatus::InProgress,
        status_reason: String::new(),
        current_traversal: traversal,
        prev_raw_template_id: None,
        raw_template_id: "tmpl-1".to_string(),
        disable_rollback: false,
        timeout_mins: 60,
        created_time: Utc::now(),
        updated_time: Utc::now(),
        convergence: true,
    }
}

struct NoDriver;

#[async_trait]
impl ResourceDriverFactory for NoDriver {
    async fn load(&self, _resource_id: ResourceId) -> Result<Box<dyn ResourceDriver>, ConvergenceError> {
        Err(ConvergenceError::Other("driver not needed by this test".to_string()))
    }
}

struct NoDispatch;

impl CheckResourceDispatcher for NoDispatch {
    fn cast_check_resource(
        &self,
        _resource_id: ResourceId,
        _traversal_id: TraversalId,
        _data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        _is_update: bool,
        _adopt_stack_data: Option<serde_json::Value>,
    ) {
    }
}

struct AlwaysAlive;

#[async_trait]
impl EngineLiveness for AlwaysAlive {
    async fn is_alive(&self, _engine_id: EngineId) -> bool {
        true
    }
}

/// None of this crate's scenarios exercise rollback; a `RollbackStarter` that panics if invoked
/// makes that assumption explicit instead of silently ignoring a bug that would trigger one.
struct UnreachableRollback;

#[async_trait]
impl RollbackStarter for UnreachableRollback {
    async fn start_rollback(&self, _stack: Stack, _new_traversal: TraversalId) -> Result<(), ConvergenceError> {
        panic!("rollback should not have been started by this scenario");
    }
}

#[derive(Default)]
struct RecordingCancelDispatcher {
    casts: Mutex<Vec<(StackId, EngineId)>>,
}

impl CancelDispatcher for RecordingCancelDispatcher {
    fn cast_cancel_check_resource(&self, stack_id: StackId, engine_id: EngineId) {
        self.casts.lock().unwrap().push((stack_id, engine_id));
    }
}

fn build_service(
    resources: Arc<InMemoryStore>,
    sync_points: Arc<InMemorySyncPointStore>,
    graphs: Arc<dyn GraphProvider>,
    cancel_dispatcher: Arc<dyn CancelDispatcher>,
) -> WorkerService {
    let runner = Arc::new(CheckRunner {
        engine_id: Uuid::new_v4(),
        resources: resources.clone(),
        stacks: resources,
        sync_points,
        graphs,
        drivers: Arc::new(NoDriver),
        dispatcher: Arc::new(NoDispatch),
        liveness: Arc::new(AlwaysAlive),
        rollback: Arc::new(UnreachableRollback),
        config: CheckerConfig::default(),
        metrics: None,
    });
    WorkerService::new(
        runner,
        cancel_dispatcher,
        task_executor::Executor::new(),
        WorkerConfig {
            cancel_retries: 2,
            cancel_retry_wait: Duration::from_millis(20),
        },
    )
}

#[tokio::test]
async fn check_resource_on_a_superseded_traversal_retriggers_instead_of_dispatching() {
    let store = Arc::new(InMemoryStore::new());
    let sync_points = Arc::new(InMemorySyncPointStore::new());
    let graphs = Arc::new(InMemoryGraphStore::new());

    let stack_id = Uuid::new_v4();
    let latest_traversal = Uuid::new_v4();
    let stale_traversal = Uuid::new_v4();
    store.seed_stack(sample_stack(stack_id, latest_traversal));

    let old_id = 1;
    let new_id = 2;
    let mut old_resource = sample_resource(old_id, stack_id);
    old_resource.replaced_by = Some(new_id);
    store.seed_resource(old_resource);
    let mut new_resource = sample_resource(new_id, stack_id);
    new_resource.replaces = Some(old_id);
    store.seed_resource(new_resource);

    // The latest graph still has an update node for the replaced-away old id (its cleanup node,
    // which is what a replacement retrigger is actually waiting on).
    let mut graph = DependencyGraph::new();
    graph.ensure_node(ConvergenceNode::cleanup(old_id));
    graphs.put(stack_id, latest_traversal, Arc::new(graph)).await;

    let service = build_service(store.clone(), sync_points.clone(), graphs, Arc::new(RecordingCancelDispatcher::default()));

    // check_resource arrives for the replacement (new_id) naming the now-superseded traversal.
    service
        .check_resource(new_id, stale_traversal, BTreeMap::new(), true, None, false)
        .await
        .unwrap();

    let purged = store.resource(new_id).unwrap();
    assert_eq!(purged.action, ResourceAction::Delete);
}

#[tokio::test]
async fn stop_traversal_bumps_cas_marks_failed_and_purges_sync_points() {
    let store = Arc::new(InMemoryStore::new());
    let sync_points = Arc::new(InMemorySyncPointStore::new());
    let graphs: Arc<dyn GraphProvider> = Arc::new(InMemoryGraphStore::new());

    let stack_id = Uuid::new_v4();
    let old_traversal = Uuid::new_v4();
    store.seed_stack(sample_stack(stack_id, old_traversal));

    let service = build_service(store.clone(), sync_points, graphs, Arc::new(RecordingCancelDispatcher::default()));

    service.stop_traversal(stack_id).await.unwrap();

    let stack = convergence_store::StackStore::get(store.as_ref(), stack_id).await.unwrap();
    assert_ne!(stack.current_traversal, old_traversal);
    assert_eq!(stack.status, StackStatus::Failed);
}

#[tokio::test]
async fn stop_all_workers_succeeds_once_locks_clear() {
    let store = Arc::new(InMemoryStore::new());
    let sync_points = Arc::new(InMemorySyncPointStore::new());
    let graphs: Arc<dyn GraphProvider> = Arc::new(InMemoryGraphStore::new());

    let stack_id = Uuid::new_v4();
    let engine_id = Uuid::new_v4();
    store.seed_stack(sample_stack(stack_id, Uuid::new_v4()));
    store.seed_resource(sample_resource(1, stack_id));
    convergence_store::ResourceStore::acquire_lock(store.as_ref(), 1, engine_id)
        .await
        .unwrap();

    let cancel_dispatcher = Arc::new(RecordingCancelDispatcher::default());
    let service = build_service(store.clone(), sync_points, graphs, cancel_dispatcher.clone());

    let store_for_release = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        convergence_store::ResourceStore::complete(
            store_for_release.as_ref(),
            1,
            engine_id,
            convergence_store::ResourceCompletion {
                action: ResourceAction::Create,
                status: ResourceStatus::Complete,
                status_reason: String::new(),
                current_template_id: "tmpl-1".to_string(),
                uuid: Uuid::new_v4(),
                reference_id: None,
                attributes: BTreeMap::new(),
                requires: BTreeSet::new(),
            },
        )
        .await
        .unwrap();
    });

    service.stop_all_workers(stack_id).await.unwrap();
    assert!(!cancel_dispatcher.casts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_all_workers_errors_when_a_lock_never_clears() {
    let store = Arc::new(InMemoryStore::new());
    let sync_points = Arc::new(InMemorySyncPointStore::new());
    let graphs: Arc<dyn GraphProvider> = Arc::new(InMemoryGraphStore::new());

    let stack_id = Uuid::new_v4();
    let engine_id = Uuid::new_v4();
    store.seed_stack(sample_stack(stack_id, Uuid::new_v4()));
    store.seed_resource(sample_resource(1, stack_id));
    convergence_store::ResourceStore::acquire_lock(store.as_ref(), 1, engine_id)
        .await
        .unwrap();

    let service = build_service(store, sync_points, graphs, Arc::new(RecordingCancelDispatcher::default()));

    let err = service.stop_all_workers(stack_id).await.unwrap_err();
    assert!(matches!(err, ConvergenceError::Other(_)));
}

/// A driver whose `create_convergence` blocks at a simulated suspension point until cancelled,
/// recording that it actually observed the cancellation rather than running to completion.
struct CancelAwareDriver {
    observed_cancel: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl ResourceDriver for CancelAwareDriver {
    async fn create_convergence(
        &mut self,
        _template_id: &str,
        _requires: BTreeSet<ResourceId>,
        _engine_id: EngineId,
        _time_remaining: Duration,
        cancel: &convergence_model::CancellationToken,
    ) -> Result<(), ConvergenceError> {
        loop {
            if let Err(e) = cancel.check() {
                self.observed_cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                return Err(e);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn update_convergence(
        &mut self,
        template_id: &str,
        requires: BTreeSet<ResourceId>,
        engine_id: EngineId,
        time_remaining: Duration,
        cancel: &convergence_model::CancellationToken,
    ) -> Result<(), ConvergenceError> {
        self.create_convergence(template_id, requires, engine_id, time_remaining, cancel)
            .await
    }

    async fn delete_convergence(
        &mut self,
        _template_id: &str,
        _engine_id: EngineId,
        _time_remaining: Duration,
        _cancel: &convergence_model::CancellationToken,
    ) -> Result<(), ConvergenceError> {
        unreachable!("not exercised by this test")
    }

    async fn make_replacement(
        &mut self,
        _new_template_id: &str,
        _requires: BTreeSet<ResourceId>,
    ) -> Result<Option<ResourceId>, ConvergenceError> {
        unreachable!("not exercised by this test")
    }

    fn node_data(&self) -> convergence_model::NodeData {
        unreachable!("not exercised by this test")
    }

    fn state_set(&mut self, _action: ResourceAction, _status: ResourceStatus, _reason: String) {}

    fn current_template_id(&self) -> &str {
        ""
    }

    fn id(&self) -> ResourceId {
        1
    }

    fn replaces(&self) -> Option<ResourceId> {
        None
    }

    fn replaced_by(&self) -> Option<ResourceId> {
        None
    }
}

struct CancelAwareDriverFactory {
    observed_cancel: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl ResourceDriverFactory for CancelAwareDriverFactory {
    async fn load(&self, _resource_id: ResourceId) -> Result<Box<dyn ResourceDriver>, ConvergenceError> {
        Ok(Box::new(CancelAwareDriver {
            observed_cancel: self.observed_cancel.clone(),
        }))
    }
}

/// S5: `cancel_check_resource` must reach an already-spawned `check_resource` task through its
/// registered `CancellationToken`, not just record the request — the in-flight driver call has
/// to actually observe the cancellation and abort.
#[tokio::test]
async fn cancel_check_resource_reaches_an_in_flight_task() {
    let store = Arc::new(InMemoryStore::new());
    let sync_points = Arc::new(InMemorySyncPointStore::new());
    let graphs: Arc<dyn GraphProvider> = Arc::new(InMemoryGraphStore::new());

    let stack_id = Uuid::new_v4();
    let traversal_id = Uuid::new_v4();
    store.seed_stack(sample_stack(stack_id, traversal_id));
    let mut resource = sample_resource(1, stack_id);
    resource.action = ResourceAction::Update;
    store.seed_resource(resource);

    let observed_cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let runner = Arc::new(CheckRunner {
        engine_id: Uuid::new_v4(),
        resources: store.clone(),
        stacks: store.clone(),
        sync_points,
        graphs,
        drivers: Arc::new(CancelAwareDriverFactory {
            observed_cancel: observed_cancel.clone(),
        }),
        dispatcher: Arc::new(NoDispatch),
        liveness: Arc::new(AlwaysAlive),
        rollback: Arc::new(UnreachableRollback),
        config: CheckerConfig::default(),
        metrics: None,
    });
    let service = WorkerService::new(
        runner,
        Arc::new(RecordingCancelDispatcher::default()),
        task_executor::Executor::new(),
        WorkerConfig {
            cancel_retries: 2,
            cancel_retry_wait: Duration::from_millis(20),
        },
    );

    service
        .check_resource(1, traversal_id, BTreeMap::new(), true, None, true)
        .await
        .unwrap();

    // Give the spawned task a moment to reach the suspension point, then cancel the stack.
    tokio::time::sleep(Duration::from_millis(20)).await;
    service.cancel_check_resource(stack_id, Uuid::new_v4()).await.unwrap();

    // Poll until the driver's loop has observed the cancellation and returned.
    for _ in 0..50 {
        if observed_cancel.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(observed_cancel.load(std::sync::atomic::Ordering::SeqCst));
}
