//! Argument validation against a function's declared parameter schema.
//!
//! Runs before every invocation so handlers only ever see well-formed
//! arguments. Unknown keys are tolerated (models like to add them); missing
//! required keys and type mismatches are not.

use serde_json::Value;

use crate::types::{FunctionSchema, ParamKind};

pub fn validate_args(schema: &FunctionSchema, args: &Value) -> Result<(), String> {
    let Some(map) = args.as_object() else {
        return Err(format!("arguments must be an object, got {}", type_name(args)));
    };

    for param in &schema.parameters {
        match map.get(&param.name) {
            None if param.required => {
                return Err(format!("missing required argument '{}'", param.name));
            }
            None => {}
            Some(value) => {
                if !kind_matches(param.kind, value) {
                    return Err(format!(
                        "argument '{}' must be {}, got {}",
                        param.name,
                        param.kind.json_type(),
                        type_name(value)
                    ));
                }
            }
        }
    }
    Ok(())
}

fn kind_matches(kind: ParamKind, value: &Value) -> bool {
    match kind {
        ParamKind::String => value.is_string(),
        ParamKind::Integer => value.is_i64() || value.is_u64(),
        ParamKind::Number => value.is_number(),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::Object => value.is_object(),
        ParamKind::Array => value.is_array(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamSpec;

    fn weather_schema() -> FunctionSchema {
        FunctionSchema {
            name: "get_weather".to_string(),
            description: "Current conditions for a location".to_string(),
            parameters: vec![
                ParamSpec {
                    name: "location".to_string(),
                    kind: ParamKind::String,
                    description: "City name".to_string(),
                    required: true,
                },
                ParamSpec {
                    name: "days".to_string(),
                    kind: ParamKind::Integer,
                    description: "Forecast days".to_string(),
                    required: false,
                },
            ],
        }
    }

    #[test]
    fn valid_args_pass() {
        let args = serde_json::json!({ "location": "Warsaw", "days": 3 });
        assert!(validate_args(&weather_schema(), &args).is_ok());
    }

    #[test]
    fn missing_required_is_rejected() {
        let args = serde_json::json!({ "days": 3 });
        let err = validate_args(&weather_schema(), &args).unwrap_err();
        assert!(err.contains("location"));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let args = serde_json::json!({ "location": 42 });
        let err = validate_args(&weather_schema(), &args).unwrap_err();
        assert!(err.contains("string"));
    }

    #[test]
    fn non_object_args_are_rejected() {
        let args = serde_json::json!("Warsaw");
        assert!(validate_args(&weather_schema(), &args).is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let args = serde_json::json!({ "location": "Warsaw", "mood": "sunny please" });
        assert!(validate_args(&weather_schema(), &args).is_ok());
    }

    #[test]
    fn optional_missing_is_fine() {
        let args = serde_json::json!({ "location": "Warsaw" });
        assert!(validate_args(&weather_schema(), &args).is_ok());
    }
}
