// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parameter-schema validation for tool arguments.
//!
//! Covers the subset of JSON Schema that tool declarations actually use:
//! `type`, `properties`, `required`, `enum`, and array `items`.  Validation
//! failures are surfaced verbatim to the model so it can self-correct.

use serde_json::Value;

/// One-level recovery for providers that stringify object parameters: any
/// property whose schema type is `object` but whose value arrived as a JSON
/// string is parsed once.  Idempotent; parse failures leave the value as-is
/// for the validator to reject.
pub fn coerce_string_objects(schema: &Value, args: &Value) -> Value {
    let mut args = args.clone();
    let (Some(props), Some(map)) = (schema["properties"].as_object(), args.as_object_mut())
    else {
        return args;
    };
    for (key, prop_schema) in props {
        if prop_schema["type"].as_str() != Some("object") {
            continue;
        }
        if let Some(Value::String(s)) = map.get(key) {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                if parsed.is_object() {
                    map.insert(key.clone(), parsed);
                }
            }
        }
    }
    args
}

/// Validate `args` against a declared parameter schema.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    validate_value(schema, args, "arguments")
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema["type"].as_str() {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            return Err(format!("{path}: expected {expected}, got {}", type_name(value)));
        }
    }

    if let Some(allowed) = schema["enum"].as_array() {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} is not one of {allowed:?}"));
        }
    }

    if let Some(props) = schema["properties"].as_object() {
        if let Some(required) = schema["required"].as_array() {
            for field in required.iter().filter_map(|f| f.as_str()) {
                if value.get(field).map(|v| v.is_null()).unwrap_or(true) {
                    return Err(format!("{path}: missing required field `{field}`"));
                }
            }
        }
        if let Some(map) = value.as_object() {
            for (key, prop_schema) in props {
                if let Some(v) = map.get(key) {
                    if !v.is_null() {
                        validate_value(prop_schema, v, &format!("{path}.{key}"))?;
                    }
                }
            }
        }
    }

    if let Some(items) = schema.get("items").filter(|i| i.is_object()) {
        if let Some(arr) = value.as_array() {
            for (i, item) in arr.iter().enumerate() {
                validate_value(items, item, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" },
                "filters": { "type": "object" },
                "mode": { "type": "string", "enum": ["fast", "full"] },
                "tags": { "type": "array", "items": { "type": "string" } },
            },
            "required": ["query"]
        })
    }

    #[test]
    fn valid_args_pass() {
        let args = json!({ "query": "rust", "limit": 3, "mode": "fast", "tags": ["a"] });
        assert!(validate_args(&schema(), &args).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let err = validate_args(&schema(), &json!({ "limit": 3 })).unwrap_err();
        assert!(err.contains("missing required field `query`"), "got: {err}");
    }

    #[test]
    fn wrong_type_fails_with_path() {
        let err = validate_args(&schema(), &json!({ "query": 7 })).unwrap_err();
        assert!(err.contains("arguments.query"), "got: {err}");
        assert!(err.contains("expected string"), "got: {err}");
    }

    #[test]
    fn enum_violation_fails() {
        let err =
            validate_args(&schema(), &json!({ "query": "x", "mode": "turbo" })).unwrap_err();
        assert!(err.contains("not one of"), "got: {err}");
    }

    #[test]
    fn array_items_are_checked() {
        let err = validate_args(&schema(), &json!({ "query": "x", "tags": [1] })).unwrap_err();
        assert!(err.contains("tags[0]"), "got: {err}");
    }

    #[test]
    fn string_object_is_coerced_once() {
        let args = json!({ "query": "x", "filters": "{\"lang\":\"rust\"}" });
        let coerced = coerce_string_objects(&schema(), &args);
        assert_eq!(coerced["filters"]["lang"], "rust");
        assert!(validate_args(&schema(), &coerced).is_ok());
    }

    #[test]
    fn coercion_is_idempotent() {
        let args = json!({ "query": "x", "filters": { "lang": "rust" } });
        let once = coerce_string_objects(&schema(), &args);
        let twice = coerce_string_objects(&schema(), &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unparseable_string_object_is_left_for_validator() {
        let args = json!({ "query": "x", "filters": "not-json" });
        let coerced = coerce_string_objects(&schema(), &args);
        let err = validate_args(&schema(), &coerced).unwrap_err();
        assert!(err.contains("filters"), "got: {err}");
    }

    #[test]
    fn non_object_schema_types_are_not_coerced() {
        // A string-typed property that happens to contain JSON stays a string.
        let args = json!({ "query": "{\"a\":1}" });
        let coerced = coerce_string_objects(&schema(), &args);
        assert!(coerced["query"].is_string());
    }
}
