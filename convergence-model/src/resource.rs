// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AttributeValue, EngineId, ResourceId};

/// The action a resource row last underwent or is undergoing. Mirrors the set a template engine
/// can request of a resource, independent of whether convergence realizes it via create, update,
/// or a driver-level no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceAction {
    Init,
    Create,
    Update,
    Delete,
    Rollback,
    Suspend,
    Resume,
    Adopt,
    Snapshot,
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceStatus {
    InProgress,
    Complete,
    Failed,
}

/// One row per declared resource, per stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub stack_id: crate::StackId,
    /// The resource's own physical identity, distinct from its stable numeric `id` and from the
    /// owning stack's id. Set once the driver's create/update call returns.
    pub uuid: uuid::Uuid,
    /// Unique within the stack.
    pub name: String,
    pub action: ResourceAction,
    pub status: ResourceStatus,
    pub status_reason: String,
    /// The template version this resource currently realizes.
    pub current_template_id: String,
    /// Identity of the worker process holding the lock, or `None`.
    pub engine_id: Option<EngineId>,
    /// Doubly-linked replacement chain.
    pub replaces: Option<ResourceId>,
    pub replaced_by: Option<ResourceId>,
    /// Resource ids this one depends on in the currently-realized template.
    pub requires: BTreeSet<ResourceId>,
    /// Outputs consumed by successors, keyed by attribute path.
    pub attributes: BTreeMap<String, AttributeValue>,
    pub reference_id: Option<String>,
}

impl Resource {
    /// `true` only for a resource that has never completed a convergence under any template —
    /// i.e. `current_template_id` has never been set. Invariant 5 of the data model.
    pub fn is_uninitialized(&self) -> bool {
        self.action == ResourceAction::Init && self.current_template_id.is_empty()
    }

    /// The flattened payload a successor receives once this resource completes: see
    /// `NodeData`. Callers resolve attribute paths lazily against `self.attributes`.
    pub fn node_data(&self) -> crate::NodeData {
        crate::NodeData {
            id: self.id,
            name: self.name.clone(),
            reference_id: self.reference_id.clone(),
            action: self.action,
            status: self.status,
            uuid: self.uuid,
            attributes: self.attributes.clone(),
        }
    }
}
