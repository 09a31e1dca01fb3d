//! Provider-specific tool schema export
//!
//! Three concrete shapes exist in the wild; all are pure translations of
//! the canonical [`ToolDefinition`], with no logic of their own:
//!
//! - **flat**: `{type: "function", name, description, parameters}`,
//!   used by realtime agent sessions
//! - **nested**: `{type: "function", function: {name, description,
//!   parameters}}`, used by OpenAI-compatible chat completions
//! - **array**: a bare array of flat objects, for providers that take
//!   the whole toolbox as one settings field

use serde_json::{json, Value};

use phone_agent_core::{ToolDefinition, ToolParamType};

fn param_type_name(param_type: ToolParamType) -> &'static str {
    match param_type {
        ToolParamType::String => "string",
        ToolParamType::Number => "number",
        ToolParamType::Boolean => "boolean",
    }
}

/// JSON-schema `parameters` object shared by every shape.
fn parameters_schema(definition: &ToolDefinition) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in &definition.parameters {
        properties.insert(
            param.name.clone(),
            json!({
                "type": param_type_name(param.param_type),
                "description": param.description,
            }),
        );
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Flat shape used by realtime agent sessions.
pub fn to_flat_schema(definition: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "name": definition.name,
        "description": definition.description,
        "parameters": parameters_schema(definition),
    })
}

/// Nested `{type, function}` shape used by chat-completions providers.
pub fn to_nested_schema(definition: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": definition.name,
            "description": definition.description,
            "parameters": parameters_schema(definition),
        }
    })
}

pub fn to_flat_schemas(definitions: &[&ToolDefinition]) -> Vec<Value> {
    definitions.iter().map(|d| to_flat_schema(d)).collect()
}

pub fn to_nested_schemas(definitions: &[&ToolDefinition]) -> Vec<Value> {
    definitions.iter().map(|d| to_nested_schema(d)).collect()
}

/// Bare-array shape.
pub fn to_array_schema(definitions: &[&ToolDefinition]) -> Value {
    Value::Array(to_flat_schemas(definitions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_core::{ToolParam, ToolPhase};

    fn definition() -> ToolDefinition {
        let mut def = ToolDefinition::new("blind_transfer", ToolPhase::InCall);
        def.description = "Transfer the caller".into();
        def.parameters.push(ToolParam {
            name: "destination".into(),
            param_type: ToolParamType::String,
            description: "Named destination".into(),
            required: true,
        });
        def.parameters.push(ToolParam {
            name: "announce".into(),
            param_type: ToolParamType::Boolean,
            description: String::new(),
            required: false,
        });
        def
    }

    #[test]
    fn flat_shape_has_top_level_name() {
        let schema = to_flat_schema(&definition());
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["name"], "blind_transfer");
        assert_eq!(schema["parameters"]["required"][0], "destination");
    }

    #[test]
    fn nested_shape_wraps_function_object() {
        let schema = to_nested_schema(&definition());
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "blind_transfer");
        assert!(schema.get("name").is_none());
        assert_eq!(
            schema["function"]["parameters"]["properties"]["announce"]["type"],
            "boolean"
        );
    }

    #[test]
    fn array_shape_is_a_bare_array() {
        let def = definition();
        let schema = to_array_schema(&[&def]);
        assert!(schema.is_array());
        assert_eq!(schema[0]["name"], "blind_transfer");
    }
}
