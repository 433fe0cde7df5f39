// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{ConvergenceError, EngineId, ResourceId};

/// A cancellation token passed by reference into a driver call. The underlying requirement (spec
/// §9, "Cooperative cancellation via a sentinel on an in-process queue") is that a driver can be
/// asked to abort cleanly at any suspension point; in Rust that's a token polled at those points
/// rather than a message pulled off an untyped queue. `check` is the tagged-outcome side of that
/// poll: it returns `Err(ConvergenceError::CancelOperation)` instead of raising, so the driver's
/// `?` propagates it through the same `Result` the rest of the call returns.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Returns a token/signal pair: the token is threaded into driver calls, the signal is held
    /// by whatever delivers `cancel_check_resource` for the owning stack.
    pub fn new_pair() -> (CancellationToken, CancellationSignal) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            CancellationToken { flag: flag.clone() },
            CancellationSignal { flag },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The poll a driver performs at each suspension point (remote calls, retry sleeps, sync
    /// point reads/writes). Mirrors heat's `check_message()`/`THREAD_CANCEL` check.
    pub fn check(&self) -> Result<(), ConvergenceError> {
        if self.is_cancelled() {
            Err(ConvergenceError::CancelOperation)
        } else {
            Ok(())
        }
    }
}

/// The writer side of a `CancellationToken`. Held by the worker service's per-stack task-group
/// entry; `cancel_check_resource` calls `signal()` on every signal registered for the stack.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn signal(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// The capability set every resource type exposes to the convergence core (spec §9, "Dynamic
/// dispatch across many resource types" / "Per-resource capability matrix"). The core is generic
/// over this trait and never depends on a concrete resource class; template parsing, provider
/// calls, and attribute reflection all live behind it, out of scope for this crate.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// `INIT` → realize the resource for the first time under `template_id`.
    async fn create_convergence(
        &mut self,
        template_id: &str,
        requires: BTreeSet<ResourceId>,
        engine_id: EngineId,
        time_remaining: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConvergenceError>;

    /// `CREATE`/`UPDATE` → bring an already-realized resource to `template_id`.
    async fn update_convergence(
        &mut self,
        template_id: &str,
        requires: BTreeSet<ResourceId>,
        engine_id: EngineId,
        time_remaining: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConvergenceError>;

    /// Tear down under `template_id` (delete, or retire a replaced predecessor).
    async fn delete_convergence(
        &mut self,
        template_id: &str,
        engine_id: EngineId,
        time_remaining: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConvergenceError>;

    /// Atomically create a replacement row when an in-place update is impossible. `Ok(None)`
    /// means a newer traversal has already taken over; `Err(UpdateInProgress)` means a concurrent
    /// traversal already claimed the replacement.
    async fn make_replacement(
        &mut self,
        new_template_id: &str,
        requires: BTreeSet<ResourceId>,
    ) -> Result<Option<ResourceId>, ConvergenceError>;

    /// The payload successors receive once this resource completes.
    fn node_data(&self) -> crate::NodeData;

    fn state_set(&mut self, action: crate::ResourceAction, status: crate::ResourceStatus, reason: String);

    fn current_template_id(&self) -> &str;

    fn id(&self) -> ResourceId;

    fn replaces(&self) -> Option<ResourceId>;

    fn replaced_by(&self) -> Option<ResourceId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_observes_a_signal_raised_after_it_was_handed_out() {
        let (token, signal) = CancellationToken::new_pair();
        assert!(token.check().is_ok());

        signal.signal();

        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ConvergenceError::CancelOperation)));
    }

    #[test]
    fn cloned_tokens_share_the_same_signal() {
        let (token, signal) = CancellationToken::new_pair();
        let clone = token.clone();

        signal.signal();

        assert!(clone.is_cancelled());
    }
}
