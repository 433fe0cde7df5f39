// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A typed value reachable by an attribute path, in place of reflecting over an untyped JSON
/// blob. Resource drivers populate these when they report `node_data`, and dependents read them
/// back through `AttributeValue` accessors rather than ad hoc `serde_json::Value` indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            AttributeValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Resolve a dotted attribute path (`"network.0.address"`) against this value, descending
    /// into maps by key and into lists by numeric index.
    pub fn resolve_path(&self, path: &str) -> Option<&AttributeValue> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                AttributeValue::Map(m) => m.get(segment)?,
                AttributeValue::List(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_path() {
        let mut networks = Vec::new();
        let mut entry = BTreeMap::new();
        entry.insert(
            "address".to_string(),
            AttributeValue::String("10.0.0.5".to_string()),
        );
        networks.push(AttributeValue::Map(entry));

        let mut root = BTreeMap::new();
        root.insert("network".to_string(), AttributeValue::List(networks));
        let value = AttributeValue::Map(root);

        assert_eq!(
            value.resolve_path("network.0.address"),
            Some(&AttributeValue::String("10.0.0.5".to_string()))
        );
        assert_eq!(value.resolve_path("network.1.address"), None);
        assert_eq!(value.resolve_path("missing"), None);
    }
}
