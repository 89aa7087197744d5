//! Callable proxy for one remote tool.
//!
//! A [`ToolProxy`] is bound to exactly one (session, remote tool) pair. It
//! forwards arguments as-is and folds every outcome into a [`ToolResult`];
//! schema validation is left to the server and nothing is retried.

use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::session::{ToolPayload, ToolSession};
use crate::{
    error::McpError,
    inventory::{FunctionSpec, NamespacedTool},
};

/// Output used when a call succeeds without any content.
pub const EMPTY_OUTPUT: &str = "No output returned.";

/// Uniform outcome of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Output rendered as plain text; strings are not re-quoted.
    pub fn output_text(&self) -> Option<String> {
        self.output.as_ref().map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

impl fmt::Display for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.output_text()) {
            (Some(error), _) => write!(f, "Error: {}", error),
            (None, Some(output)) => f.write_str(&output),
            (None, None) => f.write_str(EMPTY_OUTPUT),
        }
    }
}

impl From<ToolPayload> for ToolResult {
    fn from(payload: ToolPayload) -> Self {
        if !payload.texts.is_empty() {
            return ToolResult::success(Value::String(payload.texts.join(", ")));
        }
        match payload.structured {
            Some(structured) => ToolResult::success(structured),
            None => ToolResult::success(Value::String(EMPTY_OUTPUT.to_string())),
        }
    }
}

/// Forwarding handle for one remote tool.
pub struct ToolProxy {
    tool: NamespacedTool,
    session: Arc<dyn ToolSession>,
}

impl ToolProxy {
    pub fn new(tool: NamespacedTool, session: Arc<dyn ToolSession>) -> Self {
        Self { tool, session }
    }

    pub fn tool(&self) -> &NamespacedTool {
        &self.tool
    }

    pub fn local_name(&self) -> &str {
        &self.tool.local_name
    }

    pub fn server_id(&self) -> &str {
        &self.tool.server_id
    }

    pub fn function_spec(&self) -> FunctionSpec {
        self.tool.function_spec()
    }

    pub async fn invoke(&self, args: Map<String, Value>) -> ToolResult {
        debug!(
            server = %self.tool.server_id,
            tool = %self.tool.remote_name(),
            "Invoking remote tool"
        );

        match self.session.call_tool(self.tool.remote_name(), args).await {
            Ok(payload) => payload.into(),
            Err(McpError::RemoteTool { message, .. }) => {
                ToolResult::failure(format!("Error executing tool: {}", message))
            }
            Err(err @ (McpError::Transport { .. } | McpError::InvalidState { .. })) => {
                ToolResult::failure(format!(
                    "MCP server '{}' connection is not available: {}",
                    self.tool.server_id, err
                ))
            }
            Err(other) => ToolResult::failure(format!("Error executing tool: {}", other)),
        }
    }
}

impl fmt::Debug for ToolProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolProxy")
            .field("tool", &self.tool.local_name)
            .field("server", &self.tool.server_id)
            .field("session", &self.session.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        core::testing::{FakeBehavior, FakeSession},
        inventory::ToolDescriptor,
    };

    fn proxy_for(session: Arc<FakeSession>, remote: &str) -> ToolProxy {
        let tool = NamespacedTool::new(session.server_id().to_string(), ToolDescriptor::new(remote));
        ToolProxy::new(tool, session)
    }

    #[test]
    fn test_payload_texts_are_joined() {
        let payload = ToolPayload {
            texts: vec!["a".to_string(), "b".to_string()],
            structured: Some(json!({"ignored": true})),
        };
        let result = ToolResult::from(payload);
        assert!(result.success);
        assert_eq!(result.output, Some(json!("a, b")));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_empty_payload_placeholder() {
        let result = ToolResult::from(ToolPayload::default());
        assert_eq!(result.output_text().as_deref(), Some(EMPTY_OUTPUT));
    }

    #[test]
    fn test_structured_only_payload() {
        let payload = ToolPayload {
            texts: vec![],
            structured: Some(json!({"price": 12.5})),
        };
        let result = ToolResult::from(payload);
        assert_eq!(result.output, Some(json!({"price": 12.5})));
        assert_eq!(result.to_string(), r#"{"price":12.5}"#);
    }

    #[tokio::test]
    async fn test_invoke_forwards_to_session() {
        let session = FakeSession::ready("qstock", FakeBehavior::default());
        let proxy = proxy_for(Arc::clone(&session), "fetch_price");
        assert_eq!(proxy.local_name(), "mcp_qstock_fetch_price");

        let mut args = Map::new();
        args.insert("symbol".to_string(), json!("600519"));
        let result = proxy.invoke(args).await;

        assert!(result.success);
        assert_eq!(result.output, Some(json!("fetch_price:{\"symbol\":\"600519\"}")));
        assert_eq!(session.calls(), vec!["fetch_price".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_remote_error() {
        let session = FakeSession::ready("qstock", FakeBehavior::default());
        let result = proxy_for(session, "boom").invoke(Map::new()).await;

        assert!(!result.success);
        assert!(result.output.is_none());
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Error executing tool:"));
    }

    #[tokio::test]
    async fn test_invoke_on_closed_session() {
        let session = FakeSession::ready("qstock", FakeBehavior::default());
        session.abort();

        let result = proxy_for(session, "fetch_price").invoke(Map::new()).await;
        assert!(!result.success);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("connection is not available"));
    }
}
