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
#![allow(clippy::mutex_atomic)]

//! The Resource Check-Runner and Propagator (spec §4.3/§4.4): the part of the engine that
//! decides, for one `(resource_id, is_update)` node, what the driver's outcome means and what
//! runs next. Everything outside this crate — persistence, the graph, the RPC transport — is a
//! trait object passed in, so the runner itself has no knowledge of Postgres or gRPC.

pub mod propagate;
pub mod runner;
pub mod seams;

pub use propagate::check_stack_complete;
pub use runner::{CheckRunner, CheckerConfig};
pub use seams::{CheckResourceDispatcher, EngineLiveness, GraphProvider, ResourceDriverFactory, RollbackStarter};
