// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool descriptors and argument validation.
//!
//! A descriptor is the model-facing contract: name, description and a
//! typed parameter list rendered as JSON Schema. The registry validates
//! model-supplied arguments against it before any executor runs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn json_name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
            enum_values: None,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String, description)
    }

    pub fn number(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Number, description)
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean, description)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Structured argument failure; returned without invoking the executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required parameter '{0}'")]
    Missing(String),
    #[error("parameter '{name}' must be a {expected}")]
    WrongType { name: String, expected: &'static str },
    #[error("parameter '{0}' is not one of the allowed values")]
    NotInEnum(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// The model-facing JSON Schema:
    /// `{name, description, inputSchema: {type: object, properties, required}}`.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = Map::new();
            prop.insert("type".into(), json!(p.kind.json_name()));
            prop.insert("description".into(), json!(p.description));
            if let Some(values) = &p.enum_values {
                prop.insert("enum".into(), json!(values));
            }
            if let Some(default) = &p.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(p.name.clone(), Value::Object(prop));
            if p.required {
                required.push(p.name.clone());
            }
        }
        let mut input = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            input["required"] = json!(required);
        }
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": input,
        })
    }

    /// Validate and normalize arguments: defaults are filled in, types
    /// and enums are checked. Unknown extra keys are tolerated — models
    /// routinely add them.
    pub fn validate(&self, args: &Value) -> Result<Value, ArgumentError> {
        let mut object = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(ArgumentError::NotAnObject),
        };
        for p in &self.parameters {
            match object.get(&p.name) {
                None | Some(Value::Null) => {
                    if let Some(default) = &p.default {
                        object.insert(p.name.clone(), default.clone());
                    } else if p.required {
                        return Err(ArgumentError::Missing(p.name.clone()));
                    }
                }
                Some(value) => {
                    if !p.kind.accepts(value) {
                        return Err(ArgumentError::WrongType {
                            name: p.name.clone(),
                            expected: p.kind.json_name(),
                        });
                    }
                    if let Some(allowed) = &p.enum_values {
                        if !allowed.contains(value) {
                            return Err(ArgumentError::NotInEnum(p.name.clone()));
                        }
                    }
                }
            }
        }
        Ok(Value::Object(object))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
