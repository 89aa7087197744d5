//! In-memory connector and session for tests.
//!
//! Each fake server is scripted through a [`FakeBehavior`]. The connector
//! shares a live-handle counter and an ordered event log with everything it
//! creates, so tests can assert that teardown released every handle and in
//! which order.
//!
//! [`stub_server`] is a minimal MCP server on an in-memory pipe, for driving
//! the real rmcp-backed session.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Notify,
};
use tokio_util::sync::CancellationToken;

use super::{
    resources::{Resource, ResourceBundle},
    session::{SessionReleaser, SessionState, ToolPayload, ToolSession},
    transport::{Connection, Connector, TransportChannel, TransportTarget},
};
use crate::{
    error::{ConnectErrorKind, McpError, McpResult, TeardownWarning},
    inventory::ToolDescriptor,
};

pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

/// Tool name that a stub or fake server never answers.
pub(crate) const HANG_TOOL: &str = "hang";

/// Start an MCP server on an in-memory pipe and return the client end.
///
/// The server answers the handshake, lists `tools` and answers every call
/// with `called <name>`, except calls to [`HANG_TOOL`].
pub(crate) fn stub_server(tools: &[&str]) -> TransportChannel {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, mut server_write) = tokio::io::split(server);

    let tools: Vec<Value> = tools
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("Stub tool {}", name),
                "inputSchema": {"type": "object"}
            })
        })
        .collect();

    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            // Notifications carry no id and get no answer.
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let params = &request["params"];
            let result = match request["method"].as_str() {
                Some("initialize") => json!({
                    "protocolVersion": params["protocolVersion"],
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "stub", "version": "0.1.0"}
                }),
                Some("tools/list") => json!({ "tools": tools }),
                Some("tools/call") if params["name"] == HANG_TOOL => continue,
                Some("tools/call") => json!({
                    "content": [{
                        "type": "text",
                        "text": format!("called {}", params["name"].as_str().unwrap_or_default())
                    }]
                }),
                _ => json!({}),
            };

            let mut reply = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
            reply.push('\n');
            if server_write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    TransportChannel::Stream {
        reader: Box::new(client_read),
        writer: Box::new(client_write),
    }
}

/// Outcome of one scripted step.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Ok,
    Fail,
    Hang,
    Delay(Duration),
}

#[derive(Debug, Clone)]
pub(crate) struct FakeBehavior {
    pub open: Step,
    pub handshake: Step,
    pub list_fails: bool,
    pub tools: Vec<String>,
    pub shutdown_hangs: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            open: Step::Ok,
            handshake: Step::Ok,
            list_fails: false,
            tools: vec!["fetch_price".to_string()],
            shutdown_hangs: false,
        }
    }
}

impl FakeBehavior {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }
}

async fn run_step(step: Step) -> bool {
    match step {
        Step::Ok => true,
        Step::Fail => false,
        Step::Hang => std::future::pending::<bool>().await,
        Step::Delay(d) => {
            tokio::time::sleep(d).await;
            true
        }
    }
}

pub(crate) struct FakeSession {
    server_id: String,
    behavior: FakeBehavior,
    state: Mutex<SessionState>,
    tools: Mutex<Vec<String>>,
    list_fails: AtomicBool,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    idle: Notify,
    closing: CancellationToken,
    log: EventLog,
}

impl FakeSession {
    pub fn new(server_id: &str, behavior: FakeBehavior, log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.to_string(),
            tools: Mutex::new(behavior.tools.clone()),
            list_fails: AtomicBool::new(behavior.list_fails),
            behavior,
            state: Mutex::new(SessionState::Uninitialized),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: CancellationToken::new(),
            log,
        })
    }

    /// A session that already completed its handshake.
    pub fn ready(server_id: &str, behavior: FakeBehavior) -> Arc<Self> {
        let session = Self::new(server_id, behavior, EventLog::default());
        *session.state.lock() = SessionState::Ready;
        session
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock() = tools.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_list_fails(&self, fails: bool) {
        self.list_fails.store(fails, Ordering::SeqCst);
    }

    fn require_ready(&self) -> McpResult<()> {
        let state = *self.state.lock();
        if state == SessionState::Ready {
            Ok(())
        } else {
            Err(McpError::InvalidState {
                server_id: self.server_id.clone(),
                expected: SessionState::Ready.as_str(),
                actual: state.as_str(),
            })
        }
    }
}

#[async_trait]
impl ToolSession for FakeSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    async fn initialize(&self) -> McpResult<()> {
        let state = *self.state.lock();
        if state != SessionState::Uninitialized {
            return Err(McpError::InvalidState {
                server_id: self.server_id.clone(),
                expected: SessionState::Uninitialized.as_str(),
                actual: state.as_str(),
            });
        }

        if run_step(self.behavior.handshake).await {
            let mut state = self.state.lock();
            if *state == SessionState::Uninitialized {
                *state = SessionState::Ready;
            }
            Ok(())
        } else {
            *self.state.lock() = SessionState::Closed;
            Err(McpError::connect(
                &self.server_id,
                ConnectErrorKind::Handshake("scripted handshake failure".into()),
            ))
        }
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        self.require_ready()?;
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(McpError::transport(&self.server_id, "scripted list failure"));
        }
        let tools = self.tools.lock().clone();
        Ok(tools
            .into_iter()
            .map(|name| {
                ToolDescriptor::new(name.clone())
                    .with_description(format!("Fake tool {}", name))
                    .with_schema(json!({
                        "type": "object",
                        "properties": {"symbol": {"type": "string"}}
                    }))
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> McpResult<ToolPayload> {
        self.require_ready()?;
        self.calls.lock().push(name.to_string());

        if name == HANG_TOOL {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let _done = scopeguard::guard((), |_| {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.idle.notify_one();
            });
            self.closing.cancelled().await;
            return Err(McpError::transport(&self.server_id, "session was force-closed"));
        }
        if name == "boom" {
            return Err(McpError::RemoteTool {
                server_id: self.server_id.clone(),
                tool: name.to_string(),
                message: "scripted remote failure".to_string(),
            });
        }
        Ok(ToolPayload::text(format!("{}:{}", name, Value::Object(args))))
    }

    async fn shutdown(&self) -> Result<(), TeardownWarning> {
        self.log.lock().push(format!("shutdown:{}", self.server_id));
        if self.behavior.shutdown_hangs {
            std::future::pending::<()>().await;
        }
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = self.idle.notified() => {}
                _ = self.closing.cancelled() => break,
            }
        }
        let mut state = self.state.lock();
        let was_closed = *state == SessionState::Closed;
        *state = SessionState::Closed;
        if was_closed {
            Err(TeardownWarning::PeerClosed)
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            self.log.lock().push(format!("abort:{}", self.server_id));
        }
        *state = SessionState::Closed;
        self.closing.cancel();
    }
}

/// Stand-in for a process or HTTP client handle.
struct FakeHandle {
    label: String,
    server_id: String,
    live: Arc<AtomicUsize>,
    log: EventLog,
}

#[async_trait]
impl Resource for FakeHandle {
    fn label(&self) -> &str {
        &self.label
    }

    async fn release(self: Box<Self>) -> Result<(), TeardownWarning> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().push(format!("release:{}", self.server_id));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    behaviors: Mutex<HashMap<String, FakeBehavior>>,
    sessions: Mutex<HashMap<String, Vec<Arc<FakeSession>>>>,
    live: Arc<AtomicUsize>,
    log: EventLog,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, server_id: &str, behavior: FakeBehavior) {
        self.behaviors.lock().insert(server_id.to_string(), behavior);
    }

    /// Handles opened and not yet released.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_events(&self) {
        self.log.lock().clear();
    }

    /// Every session opened for `server_id`, oldest first.
    pub fn sessions(&self, server_id: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .get(server_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest_session(&self, server_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions(server_id).pop()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, server_id: &str, target: &TransportTarget) -> McpResult<Connection> {
        let behavior = self
            .behaviors
            .lock()
            .get(server_id)
            .cloned()
            .unwrap_or_default();
        self.log.lock().push(format!("open:{}", server_id));

        if !run_step(behavior.open).await {
            let kind = match target {
                TransportTarget::Process { command, .. } => {
                    ConnectErrorKind::Spawn(format!("{}: not found", command))
                }
                TransportTarget::EventStream { url, .. } => {
                    ConnectErrorKind::Unreachable(format!("{}: connection refused", url))
                }
            };
            return Err(McpError::connect(server_id, kind));
        }

        let mut bundle = ResourceBundle::new(server_id);
        self.live.fetch_add(1, Ordering::SeqCst);
        bundle.push(Box::new(FakeHandle {
            label: format!("fake {}", target.kind()),
            server_id: server_id.to_string(),
            live: Arc::clone(&self.live),
            log: Arc::clone(&self.log),
        }));

        let session = FakeSession::new(server_id, behavior, Arc::clone(&self.log));
        self.sessions
            .lock()
            .entry(server_id.to_string())
            .or_default()
            .push(Arc::clone(&session));

        let session: Arc<dyn ToolSession> = session;
        bundle.push(Box::new(SessionReleaser::new(Arc::clone(&session))));

        Ok(Connection { session, bundle })
    }
}
