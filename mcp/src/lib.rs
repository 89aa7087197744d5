//! Multi-server Model Context Protocol (MCP) tool client.
//!
//! ## Modules
//!
//! - [`core`]: transports, sessions, tool proxies and the client manager
//! - [`inventory`]: namespaced tool types and the tool registry
//! - [`error`]: error and teardown-warning types
//!
//! ```no_run
//! # async fn demo() -> quant_mcp::McpResult<()> {
//! use quant_mcp::{ManagerConfig, McpClientManager};
//!
//! let manager = McpClientManager::new(ManagerConfig::default());
//! manager
//!     .connect_stream("python", &["mcp_app.py".to_string()], Some("qstock"))
//!     .await?;
//!
//! let mut args = serde_json::Map::new();
//! args.insert("symbol".into(), "600519".into());
//! let result = manager.execute("mcp_qstock_fetch_price", args).await?;
//! println!("{}", result);
//!
//! manager.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod inventory;

pub use core::{config, manager};
// Re-export from core
pub use core::{
    ConfigLoadError, ConfigValidationError, ConnectReport, Connector, ManagerConfig,
    McpClientManager, McpManagerStats, McpMetrics, McpProxyConfig, McpTransport, MetricsSnapshot,
    ServerConfig, ServerRegistryConfig, ServerSummary, SessionState, TimeoutConfig, ToolResult,
    TransportTarget,
};
pub use error::{ConnectErrorKind, McpError, McpResult, TeardownWarning};
// Re-export from inventory
pub use inventory::{FunctionSpec, NamespacedTool, ToolDescriptor, ToolRegistry};
