use std::collections::HashMap;

use serde_json::{Map, Value};

/// Field encoding convention for structured records stored under a Redis
/// hash key. Strings, integers, floats, and booleans are stored as their
/// plain string form; every other value (null, arrays, objects) is stored as
/// JSON text. The coordinator applies the same convention when consuming.
pub fn encode_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Inverse of [`encode_field`]: parse the stored text as JSON, falling back
/// to a plain string when it does not parse.
pub fn decode_field(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Encode a structured record into Redis hash fields.
pub fn encode_hash(record: &Map<String, Value>) -> HashMap<String, String> {
    record
        .iter()
        .map(|(k, v)| (k.clone(), encode_field(v)))
        .collect()
}

/// Decode Redis hash fields back into a structured record.
pub fn decode_hash(fields: &HashMap<String, String>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), decode_field(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitives_stay_plain() {
        assert_eq!(encode_field(&json!("hello")), "hello");
        assert_eq!(encode_field(&json!(42)), "42");
        assert_eq!(encode_field(&json!(1.5)), "1.5");
        assert_eq!(encode_field(&json!(true)), "true");
    }

    #[test]
    fn test_structures_become_json() {
        assert_eq!(encode_field(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(encode_field(&json!([1, 2, 3])), "[1,2,3]");
        assert_eq!(encode_field(&Value::Null), "null");
    }

    #[test]
    fn test_hash_round_trip() {
        let record = json!({
            "id": "chain-1",
            "attempts": 3,
            "ratio": 0.25,
            "active": false,
            "nothing": null,
            "config": {"region": "us-east-1", "tags": ["a", "b"]},
        });
        let record = record.as_object().cloned().unwrap();

        let decoded = decode_hash(&encode_hash(&record));
        assert_eq!(Value::Object(decoded), Value::Object(record));
    }

    #[test]
    fn test_decode_plain_text_is_a_string() {
        assert_eq!(decode_field("not json"), json!("not json"));
        assert_eq!(decode_field("42"), json!(42));
    }
}
