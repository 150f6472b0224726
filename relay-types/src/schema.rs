//! Minimal argument validation against a [`crate::ToolDescriptor`]'s input schema.
//!
//! §4.2/§4.6 only require "sufficient to validate presence and primitive type of
//! required fields" — this is deliberately not a full JSON Schema validator.

use serde_json::Value;

/// Validate `args` against a JSON Schema object fragment.
///
/// Supports `{"type": "object", "properties": {...}, "required": [...]}`. Unknown
/// schema shapes are treated as permissive (no validation failure) rather than
/// rejected, since §4.2 only asks for this minimal guarantee.
///
/// Returns `Err(message)` describing the first failure found.
pub fn validate(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };
    let Some(args_obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for name in required {
            let Some(name) = name.as_str() else { continue };
            if !args_obj.contains_key(name) {
                return Err(format!("missing required argument: {name}"));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        for (name, prop_schema) in properties {
            let Some(value) = args_obj.get(name) else {
                continue;
            };
            if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
                if !type_matches(expected, value) {
                    return Err(format!(
                        "argument {name} has wrong type: expected {expected}"
                    ));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
