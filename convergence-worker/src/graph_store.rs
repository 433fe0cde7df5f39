// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A cache of per-traversal dependency graphs. Building the graph from a template is the
//! template compiler's job (out of scope, spec.md §3: "built by the template compiler"); this
//! crate only needs somewhere to stash the result between the moment a traversal starts and the
//! last `check_resource` that consults it. `InMemoryGraphStore` is the production implementation
//! — single-process, since a traversal's graph only ever needs to be read by tasks on this same
//! engine once it has been handed the work.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use convergence_checker::GraphProvider;
use convergence_graph::DependencyGraph;
use convergence_model::{ConvergenceError, StackId, TraversalId};

/// Write side of the graph cache: populated once per traversal by whatever kicks the traversal
/// off (the stack-operation API that computed the graph from the template).
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn put(&self, stack_id: StackId, traversal_id: TraversalId, graph: Arc<DependencyGraph>);
}

#[derive(Default)]
pub struct InMemoryGraphStore {
    graphs: DashMap<(StackId, TraversalId), Arc<DependencyGraph>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn put(&self, stack_id: StackId, traversal_id: TraversalId, graph: Arc<DependencyGraph>) {
        self.graphs.insert((stack_id, traversal_id), graph);
    }
}

#[async_trait]
impl GraphProvider for InMemoryGraphStore {
    async fn graph_for(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
    ) -> Result<Arc<DependencyGraph>, ConvergenceError> {
        self.graphs
            .get(&(stack_id, traversal_id))
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                ConvergenceError::NotFound(format!(
                    "graph for stack {stack_id} traversal {traversal_id}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_graph_for_round_trips() {
        let store = InMemoryGraphStore::new();
        let stack_id = uuid::Uuid::new_v4();
        let traversal_id = uuid::Uuid::new_v4();
        let graph = Arc::new(DependencyGraph::new());

        store.put(stack_id, traversal_id, graph.clone()).await;
        let got = store.graph_for(stack_id, traversal_id).await.unwrap();
        assert_eq!(got.len(), graph.len());
    }

    #[tokio::test]
    async fn graph_for_missing_traversal_is_not_found() {
        let store = InMemoryGraphStore::new();
        let err = store
            .graph_for(uuid::Uuid::new_v4(), uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::NotFound(_)));
    }
}
