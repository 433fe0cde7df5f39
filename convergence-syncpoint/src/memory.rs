// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An in-process `SyncPointStore` used by tests in this crate and by the checker/worker
//! integration tests; never used in production (that's `convergence-store`'s sqlx-backed
//! implementation).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use convergence_model::{
    ConvergenceError, SenderKey, StackId, SyncPoint, SyncPointExtra, SyncPointKey, TraversalId,
};

use crate::SyncPointStore;

#[derive(Default)]
pub struct InMemorySyncPointStore {
    rows: Mutex<BTreeMap<(i64, TraversalId, bool), SyncPoint>>,
}

impl InMemorySyncPointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncPointStore for InMemorySyncPointStore {
    async fn create(&self, stack_id: StackId, key: SyncPointKey) -> Result<(), ConvergenceError> {
        let mut rows = self.rows.lock().unwrap();
        rows.entry((key.entity_id, key.traversal_id, key.is_update))
            .or_insert_with(|| SyncPoint::new(stack_id, key));
        Ok(())
    }

    async fn get(&self, key: SyncPointKey) -> Result<SyncPoint, ConvergenceError> {
        let rows = self.rows.lock().unwrap();
        rows.get(&(key.entity_id, key.traversal_id, key.is_update))
            .cloned()
            .ok_or_else(|| ConvergenceError::NotFound(format!("sync point {key:?}")))
    }

    async fn delete_all(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
    ) -> Result<(), ConvergenceError> {
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|(_, t, _), row| !(*t == traversal_id && row.stack_id == stack_id));
        Ok(())
    }

    async fn update_input_data(
        &self,
        key: SyncPointKey,
        expected_atomic_key: i64,
        input_data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        extra_data: SyncPointExtra,
    ) -> Result<bool, ConvergenceError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&(key.entity_id, key.traversal_id, key.is_update)) else {
            return Ok(false);
        };
        if row.atomic_key != expected_atomic_key {
            return Ok(false);
        }
        row.atomic_key += 1;
        row.input_data = input_data;
        row.extra_data = extra_data;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex as StdMutex};

    use uuid::Uuid;

    use super::*;
    use crate::sync;

    fn key(entity_id: i64, traversal_id: TraversalId) -> SyncPointKey {
        SyncPointKey::new(entity_id, traversal_id, true)
    }

    #[tokio::test]
    async fn sync_propagates_once_all_predecessors_report() {
        let store = InMemorySyncPointStore::new();
        let stack_id = Uuid::new_v4();
        let traversal_id = Uuid::new_v4();
        let k = key(1, traversal_id);
        store.create(stack_id, k).await.unwrap();

        let pred_a = SenderKey::new(10, true);
        let pred_b = SenderKey::new(11, true);
        let predecessors: BTreeSet<SenderKey> = [pred_a, pred_b].into_iter().collect();

        let propagated: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut data = BTreeMap::new();
        data.insert(pred_a, Some(serde_json::json!({"a": 1})));
        let p = propagated.clone();
        sync(&store, k, &predecessors, Some(data), None, false, move |id, _, _, _| {
            p.lock().unwrap().push(id);
        })
        .await
        .unwrap();
        assert!(propagated.lock().unwrap().is_empty());

        let mut data = BTreeMap::new();
        data.insert(pred_b, Some(serde_json::json!({"b": 2})));
        let p = propagated.clone();
        sync(&store, k, &predecessors, Some(data), None, false, move |id, _, _, _| {
            p.lock().unwrap().push(id);
        })
        .await
        .unwrap();
        assert_eq!(*propagated.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn redelivering_a_contribution_does_not_double_fire_propagate() {
        let store = InMemorySyncPointStore::new();
        let stack_id = Uuid::new_v4();
        let traversal_id = Uuid::new_v4();
        let k = key(1, traversal_id);
        store.create(stack_id, k).await.unwrap();

        let pred_a = SenderKey::new(10, true);
        let predecessors: BTreeSet<SenderKey> = [pred_a].into_iter().collect();
        let propagated: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));

        for _ in 0..2 {
            let mut data = BTreeMap::new();
            data.insert(pred_a, Some(serde_json::json!({"a": 1})));
            let p = propagated.clone();
            sync(&store, k, &predecessors, Some(data), None, false, move |id, _, _, _| {
                p.lock().unwrap().push(id);
            })
            .await
            .unwrap();
        }

        assert_eq!(*propagated.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn update_on_missing_sync_point_returns_none() {
        let store = InMemorySyncPointStore::new();
        let k = key(1, Uuid::new_v4());
        let predecessors: BTreeSet<SenderKey> = BTreeSet::new();
        let result = crate::update_sync_point(&store, k, &predecessors, None, None, false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn resource_failures_accumulate_across_calls() {
        let store = InMemorySyncPointStore::new();
        let stack_id = Uuid::new_v4();
        let traversal_id = Uuid::new_v4();
        let k = key(1, traversal_id);
        store.create(stack_id, k).await.unwrap();

        let pred_a = SenderKey::new(10, true);
        let mut failures = BTreeMap::new();
        failures.insert(pred_a, "boom".to_string());
        let predecessors: BTreeSet<SenderKey> = [pred_a].into_iter().collect();

        let result = crate::update_sync_point(
            &store,
            k,
            &predecessors,
            None,
            Some(failures),
            false,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.resource_failures.get(&pred_a).unwrap(), "boom");
    }
}
