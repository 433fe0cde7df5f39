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

//! The RPC surface of spec §6, realized over gRPC/`tonic` (SPEC_FULL §6) rather than left
//! abstract. `proto` holds the generated wire types; `rpc` the handler traits a worker process
//! implements; `server` the thin `tonic` service adapters; `client` the anycast/directed cast
//! dispatchers consumed by `convergence-checker`'s `CheckResourceDispatcher`/`EngineLiveness`
//! seams.

pub mod client;
pub mod rpc;
pub mod server;
pub mod wire;

pub mod proto {
    #![allow(clippy::all, warnings)]
    tonic::include_proto!("convergence.worker.v1");
}

pub use rpc::{EngineListenerRpc, EngineWorkerRpc};
