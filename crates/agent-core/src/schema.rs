//! Tool Argument Schemas
//!
//! A small builder that compiles parameter definitions into a JSON Schema
//! object, and a validator for the subset of JSON Schema tools declare:
//! `type`, `properties`, `required`, `items`, `enum` and
//! `additionalProperties: false`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{AgentError, Result};

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, integer, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    fn typed(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
            enum_values: None,
        }
    }

    pub fn string(name: &str, description: &str) -> Self {
        Self::typed(name, "string", description)
    }

    pub fn number(name: &str, description: &str) -> Self {
        Self::typed(name, "number", description)
    }

    pub fn integer(name: &str, description: &str) -> Self {
        Self::typed(name, "integer", description)
    }

    pub fn boolean(name: &str, description: &str) -> Self {
        Self::typed(name, "boolean", description)
    }

    /// Mark the parameter optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Restrict to a fixed set of values
    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Object schema for a tool's arguments
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObjectSchema {
    pub title: Option<String>,
    pub description: Option<String>,
    pub parameters: Vec<ParameterSchema>,
}

impl ObjectSchema {
    pub fn new(parameters: Vec<ParameterSchema>) -> Self {
        Self {
            parameters,
            ..Default::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Compile into a JSON Schema object
    pub fn compile(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut prop = json!({
                "type": param.param_type,
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = Value::Array(values.clone());
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        if let Some(title) = &self.title {
            schema["title"] = json!(title);
        }
        if let Some(description) = &self.description {
            schema["description"] = json!(description);
        }
        schema
    }
}

/// Registration-time check that a tool schema describes an object
pub fn ensure_object_schema(schema: &Value) -> Result<()> {
    let Some(obj) = schema.as_object() else {
        return Err(AgentError::Config("tool schema must be a JSON object".into()));
    };
    match obj.get("type") {
        Some(Value::String(t)) if t == "object" => {}
        None if obj.contains_key("properties") => {}
        _ => {
            return Err(AgentError::Config(
                "tool schema must declare \"type\": \"object\"".into(),
            ));
        }
    }
    if let Some(props) = obj.get("properties") {
        if !props.is_object() {
            return Err(AgentError::Config("tool schema \"properties\" must be an object".into()));
        }
    }
    Ok(())
}

/// Validate `instance` against `schema`
pub fn validate(schema: &Value, instance: &Value) -> Result<()> {
    validate_at(schema, instance, "$")
}

fn validate_at(schema: &Value, instance: &Value, path: &str) -> Result<()> {
    let Some(schema) = schema.as_object() else {
        // `true`/`{}`-style permissive schemas
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, instance)) {
            return Err(AgentError::ToolValidation(format!(
                "{}: expected {}, got {}",
                path,
                allowed.join(" or "),
                type_name(instance)
            )));
        }
    }

    if let Some(Value::Array(values)) = schema.get("enum") {
        if !values.contains(instance) {
            return Err(AgentError::ToolValidation(format!(
                "{}: {} is not one of {}",
                path,
                instance,
                Value::Array(values.clone())
            )));
        }
    }

    if let Value::Object(fields) = instance {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(name) {
                    return Err(AgentError::ToolValidation(format!(
                        "{}: missing required field '{}'",
                        path, name
                    )));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (name, value) in fields {
            match properties.and_then(|p| p.get(name)) {
                Some(prop) => validate_at(prop, value, &format!("{}.{}", path, name))?,
                None => {
                    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                        return Err(AgentError::ToolValidation(format!(
                            "{}: unexpected field '{}'",
                            path, name
                        )));
                    }
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (instance, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{}[{}]", path, i))?;
        }
    }

    Ok(())
}

fn matches_type(expected: &str, instance: &Value) -> bool {
    match expected {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => true,
    }
}

fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
