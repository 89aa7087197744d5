//! Core MCP client infrastructure.

pub mod config;
pub(crate) mod http_proxy;
pub mod manager;
pub mod metrics;
pub mod resources;
pub mod session;
pub mod tool_proxy;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    ConfigLoadError, ConfigValidationError, ManagerConfig, McpProxyConfig, McpTransport,
    ServerConfig, ServerRegistryConfig, TimeoutConfig,
};
pub use manager::{ConnectReport, McpClientManager, McpManagerStats, ServerSummary};
pub use metrics::{LatencySnapshot, McpMetrics, MetricsSnapshot};
pub use resources::{Resource, ResourceBundle};
pub use session::{RmcpSession, SessionState, ToolPayload, ToolSession};
pub use tool_proxy::{ToolProxy, ToolResult, EMPTY_OUTPUT};
pub use transport::{
    open_event_stream, open_process, Connection, Connector, EventStreamHandle,
    EventStreamOptions, OpenedTransport, ProcessHandle, RmcpConnector, TransportChannel,
    TransportTarget,
};
