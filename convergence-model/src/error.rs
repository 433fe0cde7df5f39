// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::{EngineId, ResourceAction};

/// The error taxonomy shared by every component that participates in convergence. Resource
/// drivers, the dependency graph, and the sync-point store all return this type; the
/// Resource Check-Runner matches on it exhaustively to decide the next action (retry, replace,
/// fail the stack, or surface).
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConvergenceError {
    /// The requested resource, stack, or sync-point row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another engine process already holds the update lock for this resource.
    #[error("update already in progress for resource {resource_id}, held by engine {holder}")]
    UpdateInProgress {
        resource_id: crate::ResourceId,
        holder: EngineId,
    },

    /// The driver determined that the resource cannot be updated in place and must be replaced.
    /// Carries the data needed to create the replacement row.
    #[error("resource requires replacement")]
    UpdateReplace {
        new_template_id: String,
        requires: Vec<crate::ResourceId>,
    },

    /// The underlying resource operation (create/update/delete) itself failed.
    #[error("resource operation failed during {action:?}: {reason}")]
    ResourceFailure {
        reason: String,
        action: ResourceAction,
    },

    /// A check or RPC did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cooperatively cancelled, generally because the owning traversal was
    /// superseded or the stack was told to stop.
    #[error("operation cancelled")]
    CancelOperation,

    /// The dependency graph built from the stack's resources contains a cycle.
    #[error("circular dependency found: {cycle}")]
    CircularDependency { cycle: String },

    /// Any other failure that does not merit its own variant. Carries a human-readable cause so
    /// that it can still be surfaced as a stack `status_reason`.
    #[error("{0}")]
    Other(String),
}

impl ConvergenceError {
    /// True for the subset of errors that are expected, recoverable parts of normal operation
    /// (lock contention, stale traversal) rather than genuine resource failures.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            ConvergenceError::UpdateInProgress { .. } | ConvergenceError::CancelOperation
        )
    }
}

/// Deferred error propagation: the outcome of an operation that failed, where a subsequent
/// cleanup attempt (for example, marking the stack failed, or rolling back a lock) also failed.
/// The original cause is preserved as `primary`; anything that went wrong while handling it is
/// recorded in `suppressed` rather than silently discarded or allowed to mask the real cause.
#[derive(Debug, Clone)]
pub struct FailureChain {
    pub primary: ConvergenceError,
    pub suppressed: Vec<ConvergenceError>,
}

impl FailureChain {
    pub fn new(primary: ConvergenceError) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    pub fn suppress(&mut self, err: ConvergenceError) {
        self.suppressed.push(err);
    }
}

impl std::fmt::Display for FailureChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (plus {} suppressed error(s))", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureChain {}

impl From<ConvergenceError> for FailureChain {
    fn from(e: ConvergenceError) -> Self {
        FailureChain::new(e)
    }
}
