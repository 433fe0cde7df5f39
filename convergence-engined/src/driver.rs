// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The concrete `ResourceDriverFactory` a real deployment plugs in here: per spec.md §9 ("Dynamic
//! dispatch across many resource types"), template parsing, provider API calls, and attribute
//! reflection are a pluggable resource-type registry outside this repo's scope — this process
//! ships with only the seam, the way heat-engine itself loads resource plugins via a separate
//! entry-point registry rather than hardcoding them into the engine binary.

use async_trait::async_trait;

use convergence_model::{ConvergenceError, ResourceDriver, ResourceId, Stack, TraversalId};

pub struct UnimplementedDriverFactory;

#[async_trait]
impl convergence_checker::ResourceDriverFactory for UnimplementedDriverFactory {
    async fn load(&self, resource_id: ResourceId) -> Result<Box<dyn ResourceDriver>, ConvergenceError> {
        Err(ConvergenceError::Other(format!(
            "no resource driver plugin configured for resource {resource_id}; \
             wire a ResourceDriverFactory implementation before serving traffic"
        )))
    }
}

/// Building the rollback graph from `stack.raw_template_id` and seeding/dispatching it is the
/// same out-of-scope stack-operation-API job `GraphStore::put` describes for any other
/// freshly-started traversal (spec.md's "it does not render templates" non-goal) — this process
/// ships with only the seam until that API is wired in.
pub struct UnimplementedRollbackStarter;

#[async_trait]
impl convergence_checker::RollbackStarter for UnimplementedRollbackStarter {
    async fn start_rollback(&self, stack: Stack, new_traversal: TraversalId) -> Result<(), ConvergenceError> {
        Err(ConvergenceError::Other(format!(
            "stack {} was CAS'd into ROLLBACK({new_traversal}) but no RollbackStarter is wired in; \
             configure the stack-operation API's rollback-graph builder before serving traffic",
            stack.id
        )))
    }
}
