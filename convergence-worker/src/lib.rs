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

//! The Worker Service (spec §4.5): one instance per engine process, hosting the `EngineWorker`/
//! `EngineListener` RPC surface over `convergence-checker`'s `CheckRunner`. Owns the per-process
//! thread-group (every `check_resource` becomes a task on a `task_executor::Executor`) and the
//! per-stack cancellation queues that `cancel_check_resource` signals into.

pub mod cancel;
pub mod graph_store;
pub mod service;

pub use cancel::CancellationRegistry;
pub use graph_store::{GraphStore, InMemoryGraphStore};
pub use service::{WorkerConfig, WorkerService};

#[cfg(test)]
mod tests;
