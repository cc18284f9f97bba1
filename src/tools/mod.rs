// src/tools/mod.rs
//! Tool calling support for coder-bridge
//!
//! This module provides OpenAI-compatible tool call types and the parser that
//! turns Qwen3-Coder `<tool_call><function=..>` markup into structured calls.

pub mod coerce;
pub mod helpers;
pub mod parser;
pub mod scanner;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Tool definition as sent by the client in `tools`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: Function,
}

/// Function definition within a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the parameters object
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

fn function_type() -> String {
    "function".to_string()
}

/// A structured tool call produced from model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionCall,
}

/// Function name plus the JSON-encoded arguments object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Incremental construction of a function tool, mostly for tests and fixtures.
pub struct ToolBuilder {
    function: Function,
    properties: Map<String, Value>,
    required: Vec<Value>,
}

impl ToolBuilder {
    /// Declare a parameter; `required` adds it to the schema's required list.
    pub fn param(
        mut self,
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        if required {
            self.required.push(Value::String(name.clone()));
        }
        self.properties.insert(
            name,
            serde_json::json!({ "type": param_type.into(), "description": description.into() }),
        );
        self
    }

    pub fn build(mut self) -> Tool {
        self.function.parameters = serde_json::json!({
            "type": "object",
            "properties": Value::Object(self.properties),
            "required": Value::Array(self.required),
        });
        Tool {
            tool_type: function_type(),
            function: self.function,
        }
    }
}

pub fn function_tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        function: Function {
            name: name.into(),
            description: Some(description.into()),
            parameters: Value::Null,
            strict: None,
        },
        properties: Map::new(),
        required: Vec::new(),
    }
}

/// Tool choice configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// String modes: "auto" | "none" | "required"
    Mode(ToolChoiceMode),
    /// Force a specific tool
    Function {
        #[serde(rename = "type")]
        choice_type: ToolChoiceType,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceType {
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

/// The parts of a tool's parameter schema the parser consults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolSchema {
    pub name: String,
    pub required: BTreeSet<String>,
    pub properties: BTreeSet<String>,
}

impl ToolSchema {
    pub fn from_tool(tool: &Tool) -> Self {
        let params = &tool.function.parameters;
        let required = params
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let properties = params
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            name: tool.function.name.clone(),
            required,
            properties,
        }
    }

    /// The required parameter, when there is exactly one.
    pub fn sole_required(&self) -> Option<&str> {
        if self.required.len() == 1 {
            self.required.iter().next().map(String::as_str)
        } else {
            None
        }
    }
}

/// Tool schemas keyed by function name
pub type ToolSchemaMap = HashMap<String, ToolSchema>;

/// Build a ToolCall from name/arguments with a provided ID.
pub fn new_tool_call(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: impl Into<String>,
) -> ToolCall {
    ToolCall {
        id: id.into(),
        tool_type: function_type(),
        function: FunctionCall {
            name: name.into(),
            arguments: arguments.into(),
        },
    }
}

/// Generate a compact tool call ID with required `call_` prefix.
/// Uses 16 hex chars (64 bits) from UUIDv4; ids only need to be unique within one response.
pub fn generate_tool_call_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("call_{}", &raw[..16])
}
