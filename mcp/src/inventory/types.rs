//! Core types for the tool registry.

use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::{Map, Value};

/// Prefix shared by every namespaced tool name.
pub const LOCAL_NAME_PREFIX: &str = "mcp_";

/// Local name of a remote tool: `mcp_<server_id>_<remote_name>`.
pub fn local_tool_name(server_id: &str, remote_name: &str) -> String {
    format!("{}{}_{}", LOCAL_NAME_PREFIX, server_id, remote_name)
}

/// A tool as reported by its server at discovery time.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub remote_name: String,
    pub description: Option<String>,
    pub input_schema: Arc<Map<String, Value>>,
}

impl ToolDescriptor {
    pub fn new(remote_name: impl Into<String>) -> Self {
        Self {
            remote_name: remote_name.into(),
            description: None,
            input_schema: Arc::new(Map::new()),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        if let Value::Object(map) = schema {
            self.input_schema = Arc::new(map);
        }
        self
    }
}

impl From<rmcp::model::Tool> for ToolDescriptor {
    fn from(tool: rmcp::model::Tool) -> Self {
        Self {
            remote_name: tool.name.into_owned(),
            description: tool.description.map(|d| d.into_owned()),
            input_schema: tool.input_schema,
        }
    }
}

/// A discovered tool under its server-scoped local name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTool {
    pub local_name: String,
    pub server_id: String,
    pub descriptor: ToolDescriptor,
}

impl NamespacedTool {
    pub fn new(server_id: impl Into<String>, descriptor: ToolDescriptor) -> Self {
        let server_id = server_id.into();
        Self {
            local_name: local_tool_name(&server_id, &descriptor.remote_name),
            server_id,
            descriptor,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.descriptor.remote_name
    }

    pub fn description(&self) -> &str {
        self.descriptor.description.as_deref().unwrap_or_default()
    }

    /// Render as an LLM function-calling definition.
    pub fn function_spec(&self) -> FunctionSpec {
        FunctionSpec {
            kind: "function",
            function: FunctionDefinition {
                name: self.local_name.clone(),
                description: self.description().to_string(),
                parameters: Value::Object((*self.descriptor.input_schema).clone()),
            },
        }
    }
}

impl fmt::Display for NamespacedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.local_name, self.server_id, self.remote_name())
    }
}

/// `{"type": "function", "function": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
