//! Multi-server client management.
//!
//! [`McpClientManager`] owns one session and one resource bundle per server id
//! and the registry of namespaced tools discovered on them. Connect and
//! teardown for one id are serialized by a per-id async lock; calls to other
//! servers never wait on it. A failed connect leaves nothing behind.

use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    config::{ManagerConfig, ServerRegistryConfig},
    metrics::{McpMetrics, MetricsSnapshot},
    resources::ResourceBundle,
    session::{SessionState, ToolSession},
    tool_proxy::{ToolProxy, ToolResult},
    transport::{Connection, Connector, RmcpConnector, TransportTarget},
};
use crate::{
    error::{ConnectErrorKind, McpError, McpResult, TeardownWarning},
    inventory::{FunctionSpec, NamespacedTool, ToolDescriptor, ToolRegistry},
};

struct ServerEntry {
    session: Arc<dyn ToolSession>,
    bundle: ResourceBundle,
    transport: &'static str,
    connected_at: Instant,
}

/// Resources acquired by an in-progress connect. Lives outside the timed
/// future so a timeout can still roll them back.
#[derive(Default)]
struct Staging {
    connection: Option<Connection>,
}

/// Point-in-time view of one connected server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSummary {
    pub server_id: String,
    pub transport: &'static str,
    pub state: SessionState,
    pub tool_count: usize,
    pub uptime: Duration,
}

/// Statistics about the client manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpManagerStats {
    pub server_count: usize,
    pub tool_count: usize,
    pub active_executions: usize,
}

/// Outcome of [`McpClientManager::connect_from_config`].
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// Connected server ids, in connect order.
    pub connected: Vec<String>,
    pub failed: Vec<(String, McpError)>,
}

impl ConnectReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct McpClientManager {
    connector: Arc<dyn Connector>,
    config: ManagerConfig,
    servers: DashMap<String, ServerEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    registry: ToolRegistry,
    metrics: Arc<McpMetrics>,
}

impl McpClientManager {
    /// Manager that reaches servers through the rmcp SDK.
    pub fn new(config: ManagerConfig) -> Self {
        let connector = Arc::new(RmcpConnector::new(config.connect_timeout));
        Self::with_connector(connector, config)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, config: ManagerConfig) -> Self {
        Self {
            connector,
            config,
            servers: DashMap::new(),
            locks: DashMap::new(),
            registry: ToolRegistry::new(),
            metrics: Arc::new(McpMetrics::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Spawn `command` and connect to it over stdin/stdout.
    ///
    /// `server_id` defaults to the command string.
    pub async fn connect_stream(
        &self,
        command: &str,
        args: &[String],
        server_id: Option<&str>,
    ) -> McpResult<String> {
        let target = TransportTarget::process(command, args.iter().cloned());
        self.connect(target, server_id).await
    }

    /// Connect to an MCP event stream at `url`.
    ///
    /// `server_id` defaults to the URL.
    pub async fn connect_event_stream(
        &self,
        url: &str,
        server_id: Option<&str>,
    ) -> McpResult<String> {
        self.connect(TransportTarget::event_stream(url), server_id).await
    }

    /// Connect `target` under `server_id` (or its default id) and publish its
    /// tools. An existing connection with the same id is torn down first.
    ///
    /// Open, handshake and discovery together are bounded by the connect
    /// timeout. On any failure everything acquired so far is released and the
    /// id is left unregistered.
    pub async fn connect(
        &self,
        target: TransportTarget,
        server_id: Option<&str>,
    ) -> McpResult<String> {
        target.validate()?;
        let server_id = server_id
            .unwrap_or_else(|| target.default_server_id())
            .to_string();
        if server_id.trim().is_empty() {
            return Err(McpError::Config("server id must not be empty".into()));
        }

        self.serialized(&server_id, self.connect_locked(target, server_id.clone())).await
    }

    async fn connect_locked(&self, target: TransportTarget, server_id: String) -> McpResult<String> {
        if self.servers.contains_key(&server_id) {
            info!("Server '{}' is already connected, reconnecting", server_id);
            self.teardown(&server_id).await;
        }

        self.metrics.record_connect_attempt();
        debug!(server = %server_id, transport = target.kind(), "Connecting");

        let mut staging = Staging::default();
        let timeout = self.config.connect_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            self.establish(&server_id, &target, &mut staging),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::connect(
                &server_id,
                ConnectErrorKind::Timeout(timeout),
            )),
        };

        match (outcome, staging.connection.take()) {
            (Ok(descriptors), Some(connection)) => {
                let count = self.publish(&server_id, target.kind(), connection, descriptors);
                info!(
                    "Connected to {} server '{}' ({} tools)",
                    target.kind(),
                    server_id,
                    count
                );
                Ok(server_id)
            }
            (Ok(_), None) => {
                self.metrics.record_connection_error();
                Err(McpError::connect(
                    &server_id,
                    ConnectErrorKind::Handshake("connection was not retained".into()),
                ))
            }
            (Err(err), connection) => {
                self.metrics.record_connection_error();
                error!("Failed to connect to server '{}': {}", server_id, err);
                if let Some(Connection { session, bundle }) = connection {
                    self.close_session(&server_id, session, bundle).await;
                }
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        server_id: &str,
        target: &TransportTarget,
        staging: &mut Staging,
    ) -> McpResult<Vec<ToolDescriptor>> {
        let connection = self.connector.open(server_id, target).await?;
        let session = Arc::clone(&connection.session);
        staging.connection = Some(connection);

        session
            .initialize()
            .await
            .map_err(|e| as_connect_error(server_id, e, ConnectErrorKind::Handshake))?;

        session
            .list_tools()
            .await
            .map_err(|e| as_connect_error(server_id, e, ConnectErrorKind::Discovery))
    }

    /// Register the server, then make its tools visible in one swap.
    fn publish(
        &self,
        server_id: &str,
        transport: &'static str,
        connection: Connection,
        descriptors: Vec<ToolDescriptor>,
    ) -> usize {
        let Connection { session, bundle } = connection;
        let proxies = build_proxies(server_id, &session, descriptors);

        self.servers.insert(
            server_id.to_string(),
            ServerEntry {
                session,
                bundle,
                transport,
                connected_at: Instant::now(),
            },
        );
        self.metrics.record_connection_opened();
        self.registry.replace_server(server_id, proxies)
    }

    /// Connect every enabled server of `config`, in id order.
    ///
    /// A failing server is logged and reported; the others still connect.
    pub async fn connect_from_config(&self, config: &ServerRegistryConfig) -> ConnectReport {
        let mut report = ConnectReport::default();
        if !config.enabled {
            info!("MCP server registry is disabled; nothing to connect");
            return report;
        }

        for (server_id, server) in config.enabled_servers() {
            let target = server.target(config.proxy.as_ref());
            match self.connect(target, Some(server_id)).await {
                Ok(id) => report.connected.push(id),
                Err(e) => {
                    warn!("Skipping MCP server '{}': {}", server_id, e);
                    report.failed.push((server_id.clone(), e));
                }
            }
        }

        if report.connected.is_empty() {
            info!("No MCP servers connected");
        }
        report
    }

    /// Re-run discovery on a connected server and swap its tool set.
    pub async fn refresh_tools(&self, server_id: &str) -> McpResult<usize> {
        self.serialized(server_id, self.refresh_locked(server_id)).await
    }

    async fn refresh_locked(&self, server_id: &str) -> McpResult<usize> {
        let session = self
            .servers
            .get(server_id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        let descriptors = session.list_tools().await?;
        let proxies = build_proxies(server_id, &session, descriptors);
        let count = self.registry.replace_server(server_id, proxies);
        debug!(server = %server_id, tools = count, "Refreshed tools");
        Ok(count)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear down `server_id`. Unknown ids are a no-op; never fails.
    pub async fn disconnect(&self, server_id: &str) {
        if !self.serialized(server_id, self.teardown(server_id)).await {
            debug!("Disconnect of unknown server '{}' ignored", server_id);
        }
    }

    /// Tear down every server, in sorted id order.
    pub async fn disconnect_all(&self) {
        let ids = self.server_ids();
        if ids.is_empty() {
            return;
        }

        info!("Disconnecting {} MCP server(s)", ids.len());
        for server_id in ids {
            self.disconnect(&server_id).await;
        }
    }

    /// Caller holds the id's lock. Returns false when the id was unknown.
    async fn teardown(&self, server_id: &str) -> bool {
        // Tools go first so no new call can reach the closing session.
        let removed = self.registry.remove_server(server_id);

        let Some((_, entry)) = self.servers.remove(server_id) else {
            return false;
        };

        let warnings = self
            .close_session(server_id, entry.session, entry.bundle)
            .await;
        self.metrics.record_connection_closed();

        if warnings.is_empty() {
            info!("Disconnected from server '{}' ({} tools removed)", server_id, removed);
        } else {
            info!(
                "Disconnected from server '{}' ({} tools removed, {} teardown warnings)",
                server_id,
                removed,
                warnings.len()
            );
        }
        true
    }

    /// Graceful shutdown under a ceiling, then LIFO release of the bundle.
    ///
    /// Shutdown runs on its own task; the release runs whether that task
    /// finishes, times out or panics.
    async fn close_session(
        &self,
        server_id: &str,
        session: Arc<dyn ToolSession>,
        bundle: ResourceBundle,
    ) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        let shutdown_timeout = self.config.shutdown_timeout;

        let closing = Arc::clone(&session);
        let mut task = tokio::spawn(async move { closing.shutdown().await });

        match tokio::time::timeout(shutdown_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(warning))) => {
                warn!(server = %server_id, "Session shutdown race: {}", warning);
                warnings.push(warning);
            }
            Ok(Err(join_err)) => {
                let warning = TeardownWarning::TaskFailed(join_err.to_string());
                warn!(server = %server_id, "{}", warning);
                warnings.push(warning);
            }
            Err(_) => {
                task.abort();
                session.abort();
                let warning = TeardownWarning::ShutdownTimedOut(shutdown_timeout);
                warn!(server = %server_id, "{}; session force-released", warning);
                warnings.push(warning);
            }
        }
        drop(session);

        warnings.extend(bundle.release_all(self.config.release_timeout).await);
        for _ in &warnings {
            self.metrics.record_teardown_warning();
        }
        warnings
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Query every connected server for its tools, concurrently.
    ///
    /// Results are ordered by server id. A server that fails to answer is
    /// logged and left out; the call itself never fails.
    pub async fn list_tools(&self) -> Vec<NamespacedTool> {
        let mut sessions: Vec<(String, Arc<dyn ToolSession>)> = self
            .servers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().session)))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));

        let results = join_all(sessions.into_iter().map(|(server_id, session)| async move {
            let listed = session.list_tools().await;
            (server_id, listed)
        }))
        .await;

        let mut tools = Vec::new();
        for (server_id, listed) in results {
            match listed {
                Ok(descriptors) => tools.extend(
                    descriptors
                        .into_iter()
                        .map(|descriptor| NamespacedTool::new(server_id.as_str(), descriptor)),
                ),
                Err(e) => warn!("Failed to list tools from server '{}': {}", server_id, e),
            }
        }
        tools
    }

    /// Call a namespaced tool.
    ///
    /// `ToolNotFound` is returned without any I/O. Every other outcome,
    /// including remote and transport failures, is a [`ToolResult`].
    pub async fn execute(&self, tool_name: &str, args: Map<String, Value>) -> McpResult<ToolResult> {
        let proxy = self
            .registry
            .get(tool_name)
            .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?;

        self.metrics.record_call_start();
        let start_time = Instant::now();
        // Records the end of the call even when this future is dropped
        // mid-call; a call that never finished counts as failed.
        let mut succeeded = scopeguard::guard(false, |success| {
            let duration_ms = start_time.elapsed().as_millis() as u64;
            self.metrics.record_call_end(tool_name, success, duration_ms);
        });

        let result = proxy.invoke(args).await;
        *succeeded = result.success;
        drop(succeeded);

        if !result.success {
            debug!(
                tool = %tool_name,
                "Tool call failed: {}",
                result.error.as_deref().unwrap_or_default()
            );
        }

        Ok(result)
    }

    /// Published tools, ordered by local name.
    pub fn registered_tools(&self) -> Vec<NamespacedTool> {
        self.registry
            .snapshot()
            .values()
            .map(|proxy| proxy.tool().clone())
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.snapshot().keys().cloned().collect()
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.registry.contains(tool_name)
    }

    /// Function-calling definitions of every published tool.
    pub fn function_specs(&self) -> Vec<FunctionSpec> {
        self.registry
            .snapshot()
            .values()
            .map(|proxy| proxy.function_spec())
            .collect()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Connected server ids, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn has_server(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    pub fn server_summaries(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> = self
            .servers
            .iter()
            .map(|entry| ServerSummary {
                server_id: entry.key().clone(),
                transport: entry.transport,
                state: entry.session.state(),
                tool_count: 0,
                uptime: entry.connected_at.elapsed(),
            })
            .collect();
        summaries.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        for summary in &mut summaries {
            summary.tool_count = self.registry.tools_for_server(&summary.server_id).len();
        }
        summaries
    }

    pub fn stats(&self) -> McpManagerStats {
        McpManagerStats {
            server_count: self.servers.len(),
            tool_count: self.registry.len(),
            active_executions: self.metrics.snapshot().active_executions as usize,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run `work` under the per-id lock. The lock entry is dropped afterwards
    /// unless another task is holding or waiting on it.
    async fn serialized<T>(&self, server_id: &str, work: impl Future<Output = T>) -> T {
        let lock = self.locks.entry(server_id.to_string()).or_default().clone();
        let output = {
            let _guard = lock.lock().await;
            work.await
        };
        self.locks.remove_if(server_id, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
        });
        output
    }
}

fn build_proxies(
    server_id: &str,
    session: &Arc<dyn ToolSession>,
    descriptors: Vec<ToolDescriptor>,
) -> Vec<ToolProxy> {
    descriptors
        .into_iter()
        .map(|descriptor| {
            ToolProxy::new(
                NamespacedTool::new(server_id, descriptor),
                Arc::clone(session),
            )
        })
        .collect()
}

/// Connect errors pass through; anything else becomes `kind(message)`.
fn as_connect_error(
    server_id: &str,
    err: McpError,
    kind: fn(String) -> ConnectErrorKind,
) -> McpError {
    match err {
        McpError::Connect { .. } => err,
        other => McpError::connect(server_id, kind(other.to_string())),
    }
}
