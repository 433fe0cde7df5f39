// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AttributeValue, ResourceAction, ResourceId, ResourceStatus};

/// The direction a `ConvergenceNode` runs in. `Update` brings a resource to the new template
/// version; `Cleanup` retires it (delete, or tear down a replaced predecessor) under the new
/// template. `Snapshot` overlays the same graph and sync-point machinery to capture a point in
/// time without mutating `current_template_id` — it reuses every rendezvous rule a cleanup node
/// does, tagged separately so the store and propagator can tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Update,
    Cleanup,
    Snapshot,
}

impl NodeKind {
    /// The boolean `is_update` flag used throughout the sync-point key encoding and the RPC
    /// surface. `Snapshot` is carried as `false` on the wire, distinguished by an accompanying
    /// `snapshot_id` rather than a third sync-point key component.
    pub fn is_update(self) -> bool {
        matches!(self, NodeKind::Update)
    }

    pub fn from_is_update(is_update: bool) -> Self {
        if is_update {
            NodeKind::Update
        } else {
            NodeKind::Cleanup
        }
    }
}

/// The conceptual pair `(resource_id, is_update)` that identifies a unit of convergence work
/// within one traversal, plus the `snapshot_id` that disambiguates a snapshot overlay from an
/// ordinary cleanup of the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConvergenceNode {
    pub resource_id: ResourceId,
    pub kind: NodeKind,
    pub snapshot_id: Option<i64>,
}

impl ConvergenceNode {
    pub fn update(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            kind: NodeKind::Update,
            snapshot_id: None,
        }
    }

    pub fn cleanup(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            kind: NodeKind::Cleanup,
            snapshot_id: None,
        }
    }

    pub fn snapshot(resource_id: ResourceId, snapshot_id: i64) -> Self {
        Self {
            resource_id,
            kind: NodeKind::Snapshot,
            snapshot_id: Some(snapshot_id),
        }
    }

    pub fn is_update(&self) -> bool {
        self.kind.is_update()
    }
}

impl std::fmt::Display for ConvergenceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            NodeKind::Update => write!(f, "({}, update)", self.resource_id),
            NodeKind::Cleanup => write!(f, "({}, cleanup)", self.resource_id),
            NodeKind::Snapshot => write!(
                f,
                "({}, snapshot:{})",
                self.resource_id,
                self.snapshot_id.unwrap_or_default()
            ),
        }
    }
}

/// The payload a completed resource sends to its dependents: a flat map of attribute paths plus
/// the identifying fields successors need to recognize which resource produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub id: ResourceId,
    pub name: String,
    pub reference_id: Option<String>,
    pub action: ResourceAction,
    pub status: ResourceStatus,
    pub uuid: uuid::Uuid,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl NodeData {
    /// Resolve an attribute path against this node's outputs. Resolution failures contribute an
    /// absent value but never fail the propagation that carries it (§4.3.4).
    pub fn resolve(&self, path: &str) -> Option<&AttributeValue> {
        self.attributes.get(path).or_else(|| {
            self.attributes
                .values()
                .find_map(|v| v.resolve_path(path))
        })
    }
}
