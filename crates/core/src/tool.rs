//! Tool declarations — what the planner may ask the engine to do.
//!
//! Tools are a closed set of [`ToolKind`] variants. The [`ToolRegistry`] maps
//! each declared kind to its parameter schema and is the only way a planned
//! tool name becomes something the executor will dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use crate::binding;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// The built-in tool kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Run shell commands through the command-execution collaborator
    ExecuteCommands,
    /// Find files through the file-search collaborator
    SearchFiles,
    /// Ask the language model to summarize intermediate results
    Synthesize,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [
        ToolKind::ExecuteCommands,
        ToolKind::SearchFiles,
        ToolKind::Synthesize,
    ];

    /// The wire name used in plans.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::ExecuteCommands => "execute_commands",
            ToolKind::SearchFiles => "search_files",
            ToolKind::Synthesize => "synthesize",
        }
    }
}

impl FromStr for ToolKind {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type accepted by a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    StringArray,
    Object,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            ParamType::Object => value.is_object(),
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            ParamType::String => serde_json::json!({ "type": "string" }),
            ParamType::Integer => serde_json::json!({ "type": "integer" }),
            ParamType::Number => serde_json::json!({ "type": "number" }),
            ParamType::Boolean => serde_json::json!({ "type": "boolean" }),
            ParamType::StringArray => {
                serde_json::json!({ "type": "array", "items": { "type": "string" } })
            }
            ParamType::Object => serde_json::json!({ "type": "object" }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::StringArray => "array of strings",
            ParamType::Object => "object",
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    pub description: String,
    /// Filled in during validation when the parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            description: description.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty, description)
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// The declared signature of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub kind: ToolKind,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(kind: ToolKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Convert this schema into a JSON-Schema definition for the planning prompt.
    pub fn to_definition(&self) -> ToolDefinition {
        let mut properties = Map::new();
        for p in &self.params {
            let mut schema = p.ty.json_schema();
            schema["description"] = Value::String(p.description.clone());
            if let Some(default) = &p.default {
                schema["default"] = default.clone();
            }
            properties.insert(p.name.clone(), schema);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        ToolDefinition {
            name: self.kind.as_str().to_string(),
            description: self.description.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }),
        }
    }
}

/// Arguments that passed schema validation, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub kind: ToolKind,
    pub arguments: Map<String, Value>,
}

/// A registry of declared tools.
///
/// The engine uses this to:
/// 1. Render tool definitions into the planning prompt
/// 2. Reject plans that name unknown tools or malformed arguments
/// 3. Re-check resolved arguments right before dispatch
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, ToolSchema>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a tool. Each kind may be declared once.
    pub fn declare(&mut self, schema: ToolSchema) -> Result<(), ToolError> {
        if self.tools.contains_key(&schema.kind) {
            return Err(ToolError::DuplicateTool(schema.kind.to_string()));
        }
        self.tools.insert(schema.kind, schema);
        Ok(())
    }

    /// Get the schema of a declared kind.
    pub fn get(&self, kind: ToolKind) -> Option<&ToolSchema> {
        self.tools.get(&kind)
    }

    /// Resolve a tool name to its declared schema.
    pub fn lookup(&self, name: &str) -> Result<&ToolSchema, ToolError> {
        let kind: ToolKind = name.parse()?;
        self.tools
            .get(&kind)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Validate concrete arguments for a tool.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<ValidatedCall, ToolError> {
        self.check(name, arguments, false)
    }

    /// Validate arguments of a planned step.
    ///
    /// Same as [`validate`](Self::validate), except that a parameter whose
    /// value is a single step reference (`"{{step.0.paths}}"`) is accepted
    /// whatever its declared type; it is checked again once resolved.
    pub fn validate_planned(&self, name: &str, arguments: &Value) -> Result<ValidatedCall, ToolError> {
        self.check(name, arguments, true)
    }

    fn check(&self, name: &str, arguments: &Value, allow_references: bool) -> Result<ValidatedCall, ToolError> {
        let schema = self.lookup(name)?;
        let violation = |reason: String| ToolError::SchemaViolation {
            tool_name: name.to_string(),
            reason,
        };

        let empty = Map::new();
        let given = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(violation(format!("arguments must be an object, got {other}"))),
        };

        if let Some(extra) = given
            .keys()
            .find(|k| !schema.params.iter().any(|p| &p.name == *k))
        {
            return Err(violation(format!("unexpected parameter '{extra}'")));
        }

        let mut normalized = Map::new();
        for spec in &schema.params {
            match given.get(&spec.name) {
                Some(Value::Null) | None => {
                    if spec.required {
                        return Err(violation(format!("missing required parameter '{}'", spec.name)));
                    }
                    if let Some(default) = &spec.default {
                        normalized.insert(spec.name.clone(), default.clone());
                    }
                }
                Some(value) => {
                    let deferred = allow_references
                        && value.as_str().is_some_and(binding::is_whole_reference);
                    if !deferred && !spec.ty.matches(value) {
                        return Err(violation(format!(
                            "parameter '{}' must be {}",
                            spec.name,
                            spec.ty.label()
                        )));
                    }
                    normalized.insert(spec.name.clone(), value.clone());
                }
            }
        }

        Ok(ValidatedCall {
            kind: schema.kind,
            arguments: normalized,
        })
    }

    /// Get all tool definitions, ordered by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// All declared schemas, ordered by kind.
    pub fn schemas(&self) -> Vec<&ToolSchema> {
        let mut schemas: Vec<&ToolSchema> = self.tools.values().collect();
        schemas.sort_by_key(|s| s.kind);
        schemas
    }

    /// List all declared tool names.
    pub fn names(&self) -> Vec<&'static str> {
        self.schemas().into_iter().map(|s| s.kind.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
