// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Per-stack registry of in-flight `check_resource` tasks' cancellation signals (spec §4.5: "a
//! multiplexed pool: many concurrent `check_resource` tasks, each with a private cancellation
//! message queue keyed by `stack_id`"). `cancel_check_resource` broadcasts the sentinel to every
//! queue entry registered under a stack id; a task deregisters its own entry once it finishes so
//! the map doesn't grow without bound across a long-lived process.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use convergence_model::{CancellationSignal, CancellationToken, StackId};

#[derive(Default)]
pub struct CancellationRegistry {
    queues: DashMap<StackId, Vec<(u64, CancellationSignal)>>,
    next_id: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh queue entry for `stack_id` and returns the token to thread into the
    /// driver call plus an opaque id to `deregister` with once the task completes.
    pub fn register(&self, stack_id: StackId) -> (CancellationToken, u64) {
        let (token, signal) = CancellationToken::new_pair();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queues.entry(stack_id).or_default().push((id, signal));
        (token, id)
    }

    pub fn deregister(&self, stack_id: StackId, id: u64) {
        if let Some(mut entry) = self.queues.get_mut(&stack_id) {
            entry.retain(|(i, _)| *i != id);
        }
    }

    /// The `THREAD_CANCEL` sentinel broadcast: signal every task currently registered under
    /// `stack_id`. A stack with no in-flight tasks is a silent no-op.
    pub fn cancel_all(&self, stack_id: StackId) {
        if let Some(entry) = self.queues.get(&stack_id) {
            for (_, signal) in entry.value() {
                signal.signal();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_all_signals_every_registered_token() {
        let registry = CancellationRegistry::new();
        let stack_id = uuid::Uuid::new_v4();
        let (token_a, _) = registry.register(stack_id);
        let (token_b, _) = registry.register(stack_id);

        assert!(!token_a.is_cancelled());
        registry.cancel_all(stack_id);
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }

    #[test]
    fn deregister_removes_entry_so_later_cancels_miss_it() {
        let registry = CancellationRegistry::new();
        let stack_id = uuid::Uuid::new_v4();
        let (token, id) = registry.register(stack_id);
        registry.deregister(stack_id, id);
        registry.cancel_all(stack_id);
        assert!(!token.is_cancelled());
    }
}
