// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ResourceId, StackId, TraversalId};

/// The key under which every sync point row is addressed: a rendezvous scoped to one convergence
/// node within one traversal. `is_update` mirrors `ConvergenceNode::is_update` rather than
/// embedding the full three-valued `NodeKind`, matching the wire/db shape the original engine
/// uses (`(entity_id, traversal_id, is_update)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncPointKey {
    pub entity_id: ResourceId,
    pub traversal_id: TraversalId,
    pub is_update: bool,
}

impl SyncPointKey {
    pub fn new(entity_id: ResourceId, traversal_id: TraversalId, is_update: bool) -> Self {
        Self {
            entity_id,
            traversal_id,
            is_update,
        }
    }
}

/// A sender key: the `(resource_id, is_update)` pair that identifies which predecessor
/// contributed a given entry of `input_data`. Serialized on the wire/in storage as
/// `"tuple:(id, bool)"`, carried forward verbatim from the original engine per spec's Open
/// Questions (a cleaner encoding is not worth a sync-point row migration).
///
/// `Serialize`/`Deserialize` go through `to_wire`/`from_wire` rather than the derived
/// struct/tuple shape: a `BTreeMap<SenderKey, _>` (both `input_data` and
/// `extra_data.resource_failures` are keyed this way) needs a string-shaped key to round-trip
/// through `serde_json`'s object-keyed maps, which reject any key whose `Serialize` impl isn't
/// `serialize_str`/a string-like primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SenderKey {
    pub resource_id: ResourceId,
    pub is_update: bool,
}

impl Serialize for SenderKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for SenderKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SenderKeyVisitor;

        impl serde::de::Visitor<'_> for SenderKeyVisitor {
            type Value = SenderKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a \"tuple:(id, bool)\" sender key")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                SenderKey::from_wire(v).ok_or_else(|| E::custom(format!("bad sender key: {v}")))
            }
        }

        deserializer.deserialize_str(SenderKeyVisitor)
    }
}

impl SenderKey {
    pub fn new(resource_id: ResourceId, is_update: bool) -> Self {
        Self {
            resource_id,
            is_update,
        }
    }

    /// `"tuple:(3, true)"` — the wire form a string-keyed JSON map can carry.
    pub fn to_wire(self) -> String {
        format!("tuple:({}, {})", self.resource_id, self.is_update)
    }

    /// Parse a key previously produced by `to_wire`. Returns `None` for anything that isn't the
    /// `tuple:(id, bool)` shape, so callers can fall back to treating the key as an opaque string.
    pub fn from_wire(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("tuple:(")?;
        let rest = rest.strip_suffix(')')?;
        let mut parts = rest.splitn(2, ',');
        let id: ResourceId = parts.next()?.trim().parse().ok()?;
        let is_update: bool = parts.next()?.trim().parse().ok()?;
        Some(Self::new(id, is_update))
    }
}

impl std::fmt::Display for SenderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// `extra_data`: bookkeeping carried alongside `input_data` that isn't itself part of the
/// rendezvous predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPointExtra {
    #[serde(default)]
    pub resource_failures: BTreeMap<SenderKey, String>,
    #[serde(default)]
    pub skip_propagate: bool,
}

/// One persisted rendezvous record. `input_data` maps a sender key to whatever payload that
/// predecessor chose to send (`None` is a legitimate payload — e.g. a cleanup node signaling
/// completion with no attributes to forward).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPoint {
    pub stack_id: StackId,
    pub key: SyncPointKeyOwned,
    /// Monotonic; required for CAS. Strictly increasing per row (testable property #3).
    pub atomic_key: i64,
    pub input_data: BTreeMap<SenderKey, Option<serde_json::Value>>,
    pub extra_data: SyncPointExtra,
}

/// An owned, (de)serializable mirror of `SyncPointKey` — `SyncPointKey` itself is `Copy` and
/// doesn't need serde, but the owning `SyncPoint` row does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPointKeyOwned {
    pub entity_id: ResourceId,
    pub traversal_id: TraversalId,
    pub is_update: bool,
}

impl From<SyncPointKey> for SyncPointKeyOwned {
    fn from(k: SyncPointKey) -> Self {
        Self {
            entity_id: k.entity_id,
            traversal_id: k.traversal_id,
            is_update: k.is_update,
        }
    }
}

impl SyncPoint {
    pub fn new(stack_id: StackId, key: SyncPointKey) -> Self {
        Self {
            stack_id,
            key: key.into(),
            atomic_key: 0,
            input_data: BTreeMap::new(),
            extra_data: SyncPointExtra::default(),
        }
    }

    /// True once every key in `predecessors` has a corresponding entry in `input_data` —
    /// invariant 2: a successor is dispatched only after all its predecessors have arrived.
    pub fn is_ready(&self, predecessors: &std::collections::BTreeSet<SenderKey>) -> bool {
        predecessors
            .iter()
            .all(|p| self.input_data.contains_key(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_key_round_trips_through_wire_form() {
        let key = SenderKey::new(42, true);
        let wire = key.to_wire();
        assert_eq!(wire, "tuple:(42, true)");
        assert_eq!(SenderKey::from_wire(&wire), Some(key));
    }

    #[test]
    fn sender_key_wire_form_rejects_garbage() {
        assert_eq!(SenderKey::from_wire("not-a-tuple"), None);
        assert_eq!(SenderKey::from_wire("tuple:(notanumber, true)"), None);
    }

    /// Testable property (spec §8): `Deserialize(Serialize(input_data)) = input_data`, including
    /// a map keyed by `SenderKey` — this only holds if `SenderKey` serializes as a JSON string
    /// key rather than the derived struct shape, which `serde_json` rejects as a map key.
    #[test]
    fn sender_keyed_map_round_trips_through_json() {
        let mut failures: BTreeMap<SenderKey, String> = BTreeMap::new();
        failures.insert(SenderKey::new(3, true), "boom".to_string());
        failures.insert(SenderKey::new(8, false), "also boom".to_string());

        let json = serde_json::to_value(&failures).expect("non-string keys must not error");
        assert_eq!(
            json.get("tuple:(3, true)").and_then(|v| v.as_str()),
            Some("boom")
        );

        let round_tripped: BTreeMap<SenderKey, String> = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped, failures);
    }
}
