//! Protocol session over one transport channel.
//!
//! A session moves `Uninitialized -> Ready -> Closed`. The handshake runs once;
//! discovery and calls are only valid while `Ready`; shutdown is idempotent and
//! tolerates a peer that is already gone.
//!
//! Shutdown waits for in-flight requests before closing the protocol.
//! `abort` does not wait: it cancels the handshake and every in-flight request,
//! which fail with a transport error.

use std::{borrow::Cow, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    service::{QuitReason, RunningService, ServiceError},
    RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{resources::Resource, transport::TransportChannel};
use crate::{
    error::{ConnectErrorKind, McpError, McpResult, TeardownWarning},
    inventory::ToolDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded result of a successful tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPayload {
    /// Text items of the content list, in order.
    pub texts: Vec<String>,
    pub structured: Option<Value>,
}

impl ToolPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            texts: vec![text.into()],
            structured: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty() && self.structured.is_none()
    }
}

/// One live, handshake-established connection to a tool server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn server_id(&self) -> &str;

    fn state(&self) -> SessionState;

    /// Run the protocol handshake. Fails with `InvalidState` when called twice.
    async fn initialize(&self) -> McpResult<()>;

    /// Remote tool descriptors, verbatim.
    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>>;

    /// Invoke a remote tool. `RemoteTool` means the server answered with an
    /// error; `Transport` means the channel is unusable.
    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> McpResult<ToolPayload>;

    /// Graceful close. Idempotent; races with the peer come back as warnings.
    async fn shutdown(&self) -> Result<(), TeardownWarning>;

    /// Drop every protocol resource immediately, without talking to the peer.
    fn abort(&self);
}

type ClientService = RunningService<RoleClient, ()>;

enum Slot {
    Pending(TransportChannel),
    Initializing,
    Ready(Arc<ClientService>),
    Closed,
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Slot::Pending(_) | Slot::Initializing => SessionState::Uninitialized,
            Slot::Ready(_) => SessionState::Ready,
            Slot::Closed => SessionState::Closed,
        }
    }
}

/// Session backed by an rmcp client service.
pub struct RmcpSession {
    server_id: String,
    slot: Mutex<Slot>,
    /// Cancelled by `abort`.
    closing: CancellationToken,
    /// Signalled each time a request lets go of the service.
    idle: Notify,
}

impl RmcpSession {
    pub(crate) fn new(server_id: impl Into<String>, channel: TransportChannel) -> Self {
        Self {
            server_id: server_id.into(),
            slot: Mutex::new(Slot::Pending(channel)),
            closing: CancellationToken::new(),
            idle: Notify::new(),
        }
    }

    fn aborted(&self) -> McpError {
        McpError::transport(&self.server_id, "session was force-closed")
    }

    fn ready_service(&self) -> McpResult<Arc<ClientService>> {
        match &*self.slot.lock() {
            Slot::Ready(service) => Ok(Arc::clone(service)),
            other => Err(McpError::InvalidState {
                server_id: self.server_id.clone(),
                expected: SessionState::Ready.as_str(),
                actual: other.state().as_str(),
            }),
        }
    }

    fn classify_call_error(&self, tool: &str, err: ServiceError) -> McpError {
        match err {
            ServiceError::McpError(data) => McpError::RemoteTool {
                server_id: self.server_id.clone(),
                tool: tool.to_string(),
                message: data.message.to_string(),
            },
            other => McpError::transport(&self.server_id, other.to_string()),
        }
    }
}

fn decode_call_result(result: CallToolResult) -> (bool, ToolPayload) {
    let texts = result
        .content
        .iter()
        .filter_map(|item| item.raw.as_text().map(|t| t.text.clone()))
        .collect();
    let payload = ToolPayload {
        texts,
        structured: result.structured_content,
    };
    (result.is_error.unwrap_or(false), payload)
}

#[async_trait]
impl ToolSession for RmcpSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn state(&self) -> SessionState {
        self.slot.lock().state()
    }

    async fn initialize(&self) -> McpResult<()> {
        let channel = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Initializing) {
                Slot::Pending(channel) => channel,
                other => {
                    let actual = match &other {
                        Slot::Initializing => "initializing",
                        _ => other.state().as_str(),
                    };
                    *slot = other;
                    return Err(McpError::InvalidState {
                        server_id: self.server_id.clone(),
                        expected: SessionState::Uninitialized.as_str(),
                        actual,
                    });
                }
            }
        };

        let handshake = async move {
            match channel {
                TransportChannel::Stream { reader, writer } => {
                    ().serve((reader, writer)).await.map_err(|e| e.to_string())
                }
                TransportChannel::EventStream(transport) => {
                    ().serve(transport).await.map_err(|e| e.to_string())
                }
            }
        };
        let served = tokio::select! {
            served = handshake => served,
            _ = self.closing.cancelled() => Err("session closed during handshake".to_string()),
        };

        let mut slot = self.slot.lock();
        match served {
            Ok(service) => {
                if matches!(*slot, Slot::Closed) {
                    // Shut down while the handshake was in flight; drop the
                    // service so its background task ends.
                    drop(service);
                    return Err(McpError::connect(
                        &self.server_id,
                        ConnectErrorKind::Handshake("session closed during handshake".into()),
                    ));
                }
                debug!(server = %self.server_id, "Handshake complete");
                *slot = Slot::Ready(Arc::new(service));
                Ok(())
            }
            Err(e) => {
                *slot = Slot::Closed;
                Err(McpError::connect(
                    &self.server_id,
                    ConnectErrorKind::Handshake(e),
                ))
            }
        }
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        let service = scopeguard::guard(self.ready_service()?, |service| {
            drop(service);
            self.idle.notify_one();
        });

        let listed = tokio::select! {
            listed = service.list_all_tools() => listed,
            _ = self.closing.cancelled() => return Err(self.aborted()),
        };
        let tools = listed
            .map_err(|e| McpError::transport(&self.server_id, format!("list tools: {}", e)))?;
        Ok(tools.into_iter().map(ToolDescriptor::from).collect())
    }

    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> McpResult<ToolPayload> {
        let service = scopeguard::guard(self.ready_service()?, |service| {
            drop(service);
            self.idle.notify_one();
        });
        let request = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments: Some(args),
        };

        let called = tokio::select! {
            called = service.call_tool(request) => called,
            _ = self.closing.cancelled() => return Err(self.aborted()),
        };
        let result = called.map_err(|e| self.classify_call_error(name, e))?;

        let (is_error, payload) = decode_call_result(result);
        if is_error {
            let message = if payload.texts.is_empty() {
                "tool reported an error".to_string()
            } else {
                payload.texts.join(", ")
            };
            return Err(McpError::RemoteTool {
                server_id: self.server_id.clone(),
                tool: name.to_string(),
                message,
            });
        }
        Ok(payload)
    }

    async fn shutdown(&self) -> Result<(), TeardownWarning> {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Closed);
        let mut service = match previous {
            Slot::Ready(service) => service,
            Slot::Initializing => {
                self.closing.cancel();
                return Ok(());
            }
            Slot::Pending(_) | Slot::Closed => return Ok(()),
        };

        // In-flight requests hold clones of the service. Wait for them; an
        // abort cuts them and ends the wait.
        let mut waiting = false;
        let service = loop {
            match Arc::try_unwrap(service) {
                Ok(service) => break service,
                Err(shared) => {
                    let holders = Arc::strong_count(&shared).saturating_sub(1);
                    if !waiting {
                        debug!(
                            server = %self.server_id,
                            "Waiting for {} in-flight request(s) before closing",
                            holders
                        );
                        waiting = true;
                    }
                    service = shared;
                    tokio::select! {
                        _ = self.idle.notified() => {}
                        _ = self.closing.cancelled() => {
                            warn!(
                                server = %self.server_id,
                                "Session aborted with {} request(s) in flight",
                                holders
                            );
                            return Err(TeardownWarning::StillInUse(holders));
                        }
                    }
                }
            }
        };

        match service.cancel().await {
            Ok(QuitReason::Cancelled) => {
                info!(server = %self.server_id, "Session closed");
                Ok(())
            }
            Ok(QuitReason::Closed) => Err(TeardownWarning::PeerClosed),
            Ok(other) => Err(TeardownWarning::TaskFailed(format!("{:?}", other))),
            Err(e) => Err(TeardownWarning::TaskFailed(e.to_string())),
        }
    }

    fn abort(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Closed);
        // In-flight requests drop their service clones once cancelled; the
        // last drop stops the service task and closes the channel.
        self.closing.cancel();
        if !matches!(previous, Slot::Closed) {
            debug!(server = %self.server_id, "Session force-released");
        }
        drop(previous);
    }
}

/// Bundle entry that force-releases a session during teardown.
///
/// Sits on top of the transport handle, so the protocol layer is dropped
/// before the process or HTTP client underneath it.
pub(crate) struct SessionReleaser {
    session: Arc<dyn ToolSession>,
}

impl SessionReleaser {
    pub(crate) fn new(session: Arc<dyn ToolSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Resource for SessionReleaser {
    fn label(&self) -> &str {
        "session"
    }

    async fn release(self: Box<Self>) -> Result<(), TeardownWarning> {
        self.session.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rmcp::model::Content;

    use super::*;
    use crate::core::testing::{stub_server, HANG_TOOL};

    fn stub_session(tools: &[&str]) -> Arc<RmcpSession> {
        Arc::new(RmcpSession::new("stub", stub_server(tools)))
    }

    fn actual_state(err: McpError) -> &'static str {
        match err {
            McpError::InvalidState { actual, .. } => actual,
            other => panic!("Expected invalid state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_rejected() {
        let session = stub_session(&["fetch_price"]);
        assert_eq!(session.state(), SessionState::Uninitialized);

        let err = session.list_tools().await.unwrap_err();
        assert_eq!(actual_state(err), "uninitialized");
        let err = session.call_tool("fetch_price", Map::new()).await.unwrap_err();
        assert_eq!(actual_state(err), "uninitialized");
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize() {
        let session = stub_session(&["fetch_price"]);

        assert_eq!(session.shutdown().await, Ok(()));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.shutdown().await, Ok(()), "Shutdown is idempotent");

        let err = session.initialize().await.unwrap_err();
        assert_eq!(actual_state(err), "closed");
    }

    #[tokio::test]
    async fn test_initialize_list_call_and_close() {
        let session = stub_session(&["fetch_price", "fetch_kline"]);
        session.initialize().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        let err = session.initialize().await.unwrap_err();
        assert_eq!(actual_state(err), "ready");

        let names: Vec<String> = session
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.remote_name)
            .collect();
        assert_eq!(names, vec!["fetch_price", "fetch_kline"]);

        let payload = session.call_tool("fetch_price", Map::new()).await.unwrap();
        assert_eq!(payload.texts, vec!["called fetch_price"]);

        assert_eq!(session.shutdown().await, Ok(()));
        assert_eq!(session.state(), SessionState::Closed);
        let err = session.call_tool("fetch_price", Map::new()).await.unwrap_err();
        assert_eq!(actual_state(err), "closed");
    }

    #[tokio::test]
    async fn test_abort_cuts_call_that_holds_up_shutdown() {
        let session = stub_session(&[HANG_TOOL]);
        session.initialize().await.unwrap();

        let call = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call_tool(HANG_TOOL, Map::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let waited = tokio::time::timeout(Duration::from_millis(200), session.shutdown()).await;
        assert!(waited.is_err(), "Shutdown waits for the in-flight call");
        assert_eq!(session.state(), SessionState::Closed);

        session.abort();
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("abort must end the in-flight call")
            .unwrap();
        assert!(
            matches!(result, Err(McpError::Transport { .. })),
            "Expected transport error, got {:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_shutdown_completes_after_in_flight_call() {
        let session = stub_session(&["fetch_price"]);
        session.initialize().await.unwrap();

        let (called, closed) = tokio::join!(
            session.call_tool("fetch_price", Map::new()),
            async {
                tokio::task::yield_now().await;
                session.shutdown().await
            }
        );
        assert!(called.is_ok());
        assert_eq!(closed, Ok(()));
    }

    #[test]
    fn test_decode_text_content() {
        let result = CallToolResult::success(vec![Content::text("42.1"), Content::text("CNY")]);
        let (is_error, payload) = decode_call_result(result);
        assert!(!is_error);
        assert_eq!(payload.texts, vec!["42.1", "CNY"]);
        assert!(payload.structured.is_none());
    }

    #[test]
    fn test_decode_error_flag() {
        let result = CallToolResult::error(vec![Content::text("bad symbol")]);
        let (is_error, payload) = decode_call_result(result);
        assert!(is_error);
        assert_eq!(payload.texts, vec!["bad symbol"]);
    }

    #[test]
    fn test_decode_skips_non_text_items() {
        let result = CallToolResult::success(vec![Content::image("aGVsbG8=", "image/png")]);
        let (_, payload) = decode_call_result(result);
        assert!(payload.texts.is_empty());
        assert!(payload.is_empty());
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(SessionState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(SessionState::Ready.as_str(), "ready");
        assert_eq!(SessionState::Closed.as_str(), "closed");
    }
}
