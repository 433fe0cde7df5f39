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

pub mod attribute;
pub mod driver;
pub mod error;
pub mod node;
pub mod resource;
pub mod stack;
pub mod sync_point;

pub use attribute::AttributeValue;
pub use driver::{CancellationSignal, CancellationToken, ResourceDriver};
pub use error::{ConvergenceError, FailureChain};
pub use node::{ConvergenceNode, NodeData, NodeKind};
pub use resource::{Resource, ResourceAction, ResourceStatus};
pub use stack::{Stack, StackAction, StackStatus};
pub use sync_point::{SenderKey, SyncPoint, SyncPointExtra, SyncPointKey, SyncPointKeyOwned};

/// The primary key of a `Resource` row.
pub type ResourceId = i64;
/// The primary key of a `Stack` row.
pub type StackId = uuid::Uuid;
/// A per-traversal execution identity. Every time a stack's desired state is (re-)triggered, a
/// fresh `TraversalId` is minted; it threads through every sync-point key and RPC call made
/// during that traversal so that work belonging to a superseded traversal can be recognized and
/// discarded.
pub type TraversalId = uuid::Uuid;
/// Identifies the engine process instance currently holding a resource's update lock.
pub type EngineId = uuid::Uuid;
