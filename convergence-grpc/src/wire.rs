// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! JSON (de)serialization of the sender-keyed maps exchanged over the wire (spec §6: sender keys
//! round-trip as `"tuple:(id, bool)"` strings inside a JSON object).

use std::collections::BTreeMap;

use convergence_model::{ConvergenceError, SenderKey};

pub fn encode_input_data(
    data: &BTreeMap<SenderKey, Option<serde_json::Value>>,
) -> Result<String, ConvergenceError> {
    let object: serde_json::Map<String, serde_json::Value> = data
        .iter()
        .map(|(k, v)| (k.to_wire(), v.clone().unwrap_or(serde_json::Value::Null)))
        .collect();
    serde_json::to_string(&serde_json::Value::Object(object))
        .map_err(|e| ConvergenceError::Other(format!("failed to encode input data: {e}")))
}

pub fn decode_input_data(
    json: &str,
) -> Result<BTreeMap<SenderKey, Option<serde_json::Value>>, ConvergenceError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ConvergenceError::Other(format!("failed to decode input data: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| ConvergenceError::Other("input data is not a JSON object".to_string()))?;
    object
        .iter()
        .map(|(k, v)| {
            let key = SenderKey::from_wire(k)
                .ok_or_else(|| ConvergenceError::Other(format!("bad sender key on wire: {k}")))?;
            let value = if v.is_null() { None } else { Some(v.clone()) };
            Ok((key, value))
        })
        .collect()
}

pub fn encode_optional(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

pub fn decode_optional(value: Option<String>) -> Result<Option<serde_json::Value>, ConvergenceError> {
    match value {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| ConvergenceError::Other(format!("failed to decode adopt_stack_data: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_data_round_trips_through_wire_form() {
        let mut data = BTreeMap::new();
        data.insert(SenderKey::new(3, true), Some(serde_json::json!({"a": 1})));
        data.insert(SenderKey::new(8, false), None);

        let encoded = encode_input_data(&data).unwrap();
        let decoded = decode_input_data(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn optional_json_round_trips_including_absence() {
        assert_eq!(decode_optional(encode_optional(&None)).unwrap(), None);
        let some = Some(serde_json::json!({"x": true}));
        assert_eq!(decode_optional(encode_optional(&some)).unwrap(), some);
    }
}
