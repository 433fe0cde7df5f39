// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An in-process `ResourceStore`/`StackStore` test double with the same CAS semantics as `pg`.
//! Used by `convergence-checker`'s integration tests so the end-to-end scenarios in spec §8 can
//! run without a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use convergence_model::{
    EngineId, ConvergenceError, Resource, ResourceAction, ResourceId, ResourceStatus, Stack,
    StackId, TraversalId,
};

use crate::{ResourceCompletion, ResourceStore, StackStore};

/// In-memory `resource`/`stack` tables. Resource ids are minted sequentially starting above any
/// id seeded at construction time, mirroring a Postgres `SERIAL` column.
pub struct InMemoryStore {
    resources: Mutex<BTreeMap<ResourceId, Resource>>,
    stacks: Mutex<BTreeMap<StackId, Stack>>,
    next_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(BTreeMap::new()),
            stacks: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn seed_resource(&self, resource: Resource) {
        self.next_id
            .fetch_max(resource.id + 1, Ordering::SeqCst);
        self.resources.lock().unwrap().insert(resource.id, resource);
    }

    pub fn seed_stack(&self, stack: Stack) {
        self.stacks.lock().unwrap().insert(stack.id, stack);
    }

    pub fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.resources.lock().unwrap().get(&id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, id: ResourceId) -> Result<Resource, ConvergenceError> {
        self.resources
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| ConvergenceError::NotFound(format!("resource {id}")))
    }

    async fn acquire_lock(
        &self,
        id: ResourceId,
        engine_id: EngineId,
    ) -> Result<Resource, ConvergenceError> {
        let mut resources = self.resources.lock().unwrap();
        let resource = resources
            .get_mut(&id)
            .ok_or_else(|| ConvergenceError::NotFound(format!("resource {id}")))?;
        match resource.engine_id {
            Some(holder) if holder != engine_id => Err(ConvergenceError::UpdateInProgress {
                resource_id: id,
                holder,
            }),
            _ => {
                resource.engine_id = Some(engine_id);
                Ok(resource.clone())
            }
        }
    }

    async fn complete(
        &self,
        id: ResourceId,
        engine_id: EngineId,
        completion: ResourceCompletion,
    ) -> Result<(), ConvergenceError> {
        let mut resources = self.resources.lock().unwrap();
        let resource = resources
            .get_mut(&id)
            .ok_or_else(|| ConvergenceError::NotFound(format!("resource {id}")))?;
        if resource.engine_id != Some(engine_id) {
            return Err(ConvergenceError::UpdateInProgress {
                resource_id: id,
                holder: resource.engine_id.unwrap_or(engine_id),
            });
        }
        resource.engine_id = None;
        resource.action = completion.action;
        resource.status = completion.status;
        resource.status_reason = completion.status_reason;
        resource.current_template_id = completion.current_template_id;
        resource.uuid = completion.uuid;
        resource.reference_id = completion.reference_id;
        resource.attributes = completion.attributes;
        resource.requires = completion.requires;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: ResourceId,
        engine_id: EngineId,
        action: ResourceAction,
        reason: String,
    ) -> Result<(), ConvergenceError> {
        let mut resources = self.resources.lock().unwrap();
        let resource = resources
            .get_mut(&id)
            .ok_or_else(|| ConvergenceError::NotFound(format!("resource {id}")))?;
        if resource.engine_id != Some(engine_id) {
            return Ok(());
        }
        resource.engine_id = None;
        resource.action = action;
        resource.status = ResourceStatus::Failed;
        resource.status_reason = reason;
        Ok(())
    }

    async fn steal_lock(
        &self,
        id: ResourceId,
        dead_engine_id: EngineId,
        action: ResourceAction,
        reason: String,
    ) -> Result<(), ConvergenceError> {
        let mut resources = self.resources.lock().unwrap();
        let Some(resource) = resources.get_mut(&id) else {
            return Ok(());
        };
        if resource.engine_id != Some(dead_engine_id) {
            return Ok(());
        }
        resource.engine_id = None;
        resource.action = action;
        resource.status = ResourceStatus::Failed;
        resource.status_reason = reason;
        Ok(())
    }

    async fn create_replacement(
        &self,
        id: ResourceId,
        new_template_id: String,
        requires: BTreeSet<ResourceId>,
    ) -> Result<Option<ResourceId>, ConvergenceError> {
        let mut resources = self.resources.lock().unwrap();
        let old = resources
            .get(&id)
            .cloned()
            .ok_or_else(|| ConvergenceError::NotFound(format!("resource {id}")))?;
        if old.replaced_by.is_some() {
            return Ok(None);
        }

        let new_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let replacement = Resource {
            id: new_id,
            stack_id: old.stack_id,
            uuid: uuid::Uuid::new_v4(),
            name: old.name.clone(),
            action: ResourceAction::Init,
            status: ResourceStatus::InProgress,
            status_reason: String::new(),
            current_template_id: new_template_id,
            engine_id: None,
            replaces: Some(id),
            replaced_by: None,
            requires,
            attributes: BTreeMap::new(),
            reference_id: None,
        };
        resources.insert(new_id, replacement);
        resources.get_mut(&id).unwrap().replaced_by = Some(new_id);
        Ok(Some(new_id))
    }

    async fn mark_for_purge(&self, id: ResourceId) -> Result<(), ConvergenceError> {
        let mut resources = self.resources.lock().unwrap();
        let Some(resource) = resources.get_mut(&id) else {
            return Ok(());
        };
        resource.action = ResourceAction::Delete;
        Ok(())
    }
}

#[async_trait]
impl StackStore for InMemoryStore {
    async fn get(&self, id: StackId) -> Result<Stack, ConvergenceError> {
        self.stacks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| ConvergenceError::NotFound(format!("stack {id}")))
    }

    async fn update_traversal(
        &self,
        id: StackId,
        expected: TraversalId,
        new_traversal: TraversalId,
    ) -> Result<bool, ConvergenceError> {
        let mut stacks = self.stacks.lock().unwrap();
        let Some(stack) = stacks.get_mut(&id) else {
            return Ok(false);
        };
        if stack.current_traversal != expected {
            return Ok(false);
        }
        stack.current_traversal = new_traversal;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: StackId,
        expected_traversal: TraversalId,
        reason: String,
    ) -> Result<bool, ConvergenceError> {
        let mut stacks = self.stacks.lock().unwrap();
        let stack = stacks
            .get_mut(&id)
            .ok_or_else(|| ConvergenceError::NotFound(format!("stack {id}")))?;
        if stack.current_traversal != expected_traversal {
            return Ok(false);
        }
        stack.status = convergence_model::StackStatus::Failed;
        stack.status_reason = reason;
        Ok(true)
    }

    async fn mark_complete(
        &self,
        id: StackId,
        expected_traversal: TraversalId,
    ) -> Result<bool, ConvergenceError> {
        let mut stacks = self.stacks.lock().unwrap();
        let stack = stacks
            .get_mut(&id)
            .ok_or_else(|| ConvergenceError::NotFound(format!("stack {id}")))?;
        if stack.current_traversal != expected_traversal {
            return Ok(false);
        }
        stack.status = convergence_model::StackStatus::Complete;
        stack.status_reason = String::new();
        Ok(true)
    }

    async fn start_rollback(
        &self,
        id: StackId,
        expected_traversal: TraversalId,
        new_traversal: TraversalId,
        reason: String,
    ) -> Result<bool, ConvergenceError> {
        let mut stacks = self.stacks.lock().unwrap();
        let stack = stacks
            .get_mut(&id)
            .ok_or_else(|| ConvergenceError::NotFound(format!("stack {id}")))?;
        if stack.current_traversal != expected_traversal {
            return Ok(false);
        }
        let Some(prev) = stack.prev_raw_template_id.clone() else {
            return Ok(false);
        };
        let current = std::mem::replace(&mut stack.raw_template_id, prev);
        stack.prev_raw_template_id = Some(current);
        stack.action = ResourceAction::Rollback;
        stack.status = convergence_model::StackStatus::InProgress;
        stack.status_reason = reason;
        stack.current_traversal = new_traversal;
        Ok(true)
    }

    async fn engine_get_all_locked_by_stack(
        &self,
        stack_id: StackId,
    ) -> Result<Vec<EngineId>, ConvergenceError> {
        let resources = self.resources.lock().unwrap();
        let mut ids: Vec<EngineId> = resources
            .values()
            .filter(|r| r.stack_id == stack_id)
            .filter_map(|r| r.engine_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn children_in_progress(
        &self,
        _root_stack_id: StackId,
    ) -> Result<Vec<Stack>, ConvergenceError> {
        // The in-memory double does not model nested/child stacks; there are never any.
        Ok(Vec::new())
    }
}
