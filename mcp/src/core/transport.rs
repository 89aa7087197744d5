//! Transport adapters and the connector seam.
//!
//! A transport adapter opens one raw duplex channel to one server: the stdin
//! and stdout of a spawned process, or a server-sent event stream reached over
//! HTTP(S). The OS-level handle behind the channel goes into the server's
//! resource bundle. A [`Connector`] pairs an opened channel with an
//! uninitialized session.

use std::{collections::HashMap, fmt, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use rmcp::transport::{sse_client::SseClientConfig, SseClientTransport};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
};
use tracing::{debug, info};

use super::{
    config::McpProxyConfig,
    http_proxy::build_http_client,
    resources::{Resource, ResourceBundle},
    session::{RmcpSession, SessionReleaser, ToolSession},
};
use crate::error::{ConnectErrorKind, McpError, McpResult, TeardownWarning};

/// How long a stdio server gets to exit on its own once its stdin closes.
const PROCESS_EXIT_GRACE: Duration = Duration::from_millis(500);

const DEFAULT_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a server lives and how to reach it.
#[derive(Clone)]
pub enum TransportTarget {
    /// Subprocess speaking newline-delimited JSON-RPC on stdin/stdout.
    Process {
        command: String,
        args: Vec<String>,
        envs: HashMap<String, String>,
    },
    /// MCP over HTTP server-sent events.
    EventStream {
        url: String,
        token: Option<String>,
        headers: HashMap<String, String>,
        proxy: Option<McpProxyConfig>,
    },
}

impl TransportTarget {
    pub fn process<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TransportTarget::Process {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: HashMap::new(),
        }
    }

    pub fn event_stream(url: impl Into<String>) -> Self {
        TransportTarget::EventStream {
            url: url.into(),
            token: None,
            headers: HashMap::new(),
            proxy: None,
        }
    }

    /// Server id used when the caller does not pick one: the command string
    /// or the URL.
    pub fn default_server_id(&self) -> &str {
        match self {
            TransportTarget::Process { command, .. } => command,
            TransportTarget::EventStream { url, .. } => url,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportTarget::Process { .. } => "process",
            TransportTarget::EventStream { .. } => "event-stream",
        }
    }

    pub(crate) fn validate(&self) -> McpResult<()> {
        match self {
            TransportTarget::Process { command, .. } if command.trim().is_empty() => Err(
                McpError::Config("server command is required for a process transport".into()),
            ),
            TransportTarget::EventStream { url, .. } if url.trim().is_empty() => Err(
                McpError::Config("server URL is required for an event-stream transport".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportTarget::Process {
                command,
                args,
                envs,
            } => f
                .debug_struct("Process")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
            TransportTarget::EventStream {
                url,
                token,
                headers,
                proxy,
            } => f
                .debug_struct("EventStream")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .field("proxy", &proxy.is_some())
                .finish(),
        }
    }
}

pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;
pub type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Raw duplex channel handed to the session.
pub enum TransportChannel {
    /// Newline-delimited JSON-RPC over a byte stream, normally a child's
    /// stdout and stdin.
    Stream {
        reader: StreamReader,
        writer: StreamWriter,
    },
    EventStream(SseClientTransport<reqwest::Client>),
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportChannel::Stream { .. } => f.write_str("TransportChannel::Stream"),
            TransportChannel::EventStream(_) => f.write_str("TransportChannel::EventStream"),
        }
    }
}

/// A channel plus the OS-level handle that keeps it alive.
pub struct OpenedTransport {
    pub channel: TransportChannel,
    pub handle: Box<dyn Resource>,
}

/// Handle to a spawned server process.
pub struct ProcessHandle {
    label: String,
    child: Child,
}

impl ProcessHandle {
    fn new(command: &str, child: Child) -> Self {
        let label = match child.id() {
            Some(pid) => format!("process {} (pid {})", command, pid),
            None => format!("process {}", command),
        };
        Self { label, child }
    }
}

#[async_trait]
impl Resource for ProcessHandle {
    fn label(&self) -> &str {
        &self.label
    }

    async fn release(mut self: Box<Self>) -> Result<(), TeardownWarning> {
        match self.child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                debug!("{} had already exited with {}", self.label, status);
                return Err(TeardownWarning::AlreadyExited);
            }
            Ok(None) => {}
            Err(e) => {
                return Err(TeardownWarning::Io {
                    label: self.label.clone(),
                    message: e.to_string(),
                })
            }
        }

        // Stdio servers normally exit once their stdin is closed.
        if let Ok(Ok(status)) = tokio::time::timeout(PROCESS_EXIT_GRACE, self.child.wait()).await {
            debug!("{} exited with {}", self.label, status);
            return Ok(());
        }

        match self.child.kill().await {
            Ok(()) => {
                debug!("Killed {}", self.label);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(TeardownWarning::AlreadyExited)
            }
            Err(e) => Err(TeardownWarning::Io {
                label: self.label.clone(),
                message: e.to_string(),
            }),
        }
    }
}

/// Handle to the HTTP client behind an event stream.
pub struct EventStreamHandle {
    label: String,
    client: Option<reqwest::Client>,
}

#[async_trait]
impl Resource for EventStreamHandle {
    fn label(&self) -> &str {
        &self.label
    }

    async fn release(mut self: Box<Self>) -> Result<(), TeardownWarning> {
        // Pooled connections close once the last client clone is gone; the
        // transport's clone goes with the session above this entry.
        drop(self.client.take());
        Ok(())
    }
}

/// Spawn `command` with piped stdio.
///
/// The child is killed on drop, so an error or a cancelled connect never
/// leaves a process behind.
pub fn open_process(
    server_id: &str,
    command: &str,
    args: &[String],
    envs: &HashMap<String, String>,
) -> McpResult<OpenedTransport> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        McpError::connect(server_id, ConnectErrorKind::Spawn(format!("{}: {}", command, e)))
    })?;

    let (stdout, stdin) = match (child.stdout.take(), child.stdin.take()) {
        (Some(stdout), Some(stdin)) => (stdout, stdin),
        _ => {
            let _ = child.start_kill();
            return Err(McpError::connect(
                server_id,
                ConnectErrorKind::Spawn(format!("{}: stdio pipes unavailable", command)),
            ));
        }
    };

    let handle = ProcessHandle::new(command, child);
    debug!(server = %server_id, "Spawned {}", handle.label);

    Ok(OpenedTransport {
        channel: TransportChannel::Stream {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        },
        handle: Box::new(handle),
    })
}

/// Options for [`open_event_stream`].
#[derive(Debug, Clone, Default)]
pub struct EventStreamOptions {
    pub token: Option<String>,
    pub headers: HashMap<String, String>,
    pub proxy: Option<McpProxyConfig>,
    /// Ceiling for reaching the server and receiving its endpoint event.
    /// There is no read timeout afterwards: an idle stream is normal.
    pub connect_timeout: Option<Duration>,
}

/// Open the event stream at `url` and wait for the endpoint announcement.
///
/// A refused or unreachable endpoint fails immediately with
/// [`ConnectErrorKind::Unreachable`]; nothing retries it here. A server that
/// accepts the connection but never announces its endpoint fails with
/// [`ConnectErrorKind::Timeout`] once the connect timeout has passed.
pub async fn open_event_stream(
    server_id: &str,
    url: &str,
    options: &EventStreamOptions,
) -> McpResult<OpenedTransport> {
    let connect_timeout = options.connect_timeout.unwrap_or(DEFAULT_HTTP_CONNECT_TIMEOUT);
    let client = build_http_client(
        connect_timeout,
        options.proxy.as_ref(),
        options.token.as_deref(),
        &options.headers,
    )
    .map_err(|e| McpError::Config(format!("server '{}': {}", server_id, e)))?;

    let cfg = SseClientConfig {
        sse_endpoint: url.to_string().into(),
        ..Default::default()
    };

    let started = tokio::time::timeout(
        connect_timeout,
        SseClientTransport::start_with_client(client.clone(), cfg),
    )
    .await
    .map_err(|_| McpError::connect(server_id, ConnectErrorKind::Timeout(connect_timeout)))?;

    let transport = started.map_err(|e| {
        McpError::connect(
            server_id,
            ConnectErrorKind::Unreachable(format!("{}: {}", url, e)),
        )
    })?;

    info!(server = %server_id, "Event stream open at {}", url);

    Ok(OpenedTransport {
        channel: TransportChannel::EventStream(transport),
        handle: Box::new(EventStreamHandle {
            label: format!("event-stream {}", url),
            client: Some(client),
        }),
    })
}

/// An uninitialized session and the resources acquired to open it.
pub struct Connection {
    pub session: Arc<dyn ToolSession>,
    pub bundle: ResourceBundle,
}

/// Opens transports and wraps them into sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, server_id: &str, target: &TransportTarget) -> McpResult<Connection>;
}

/// Production connector backed by the rmcp SDK.
#[derive(Debug, Clone)]
pub struct RmcpConnector {
    http_connect_timeout: Duration,
}

impl RmcpConnector {
    pub fn new(http_connect_timeout: Duration) -> Self {
        Self {
            http_connect_timeout,
        }
    }
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_HTTP_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn open(&self, server_id: &str, target: &TransportTarget) -> McpResult<Connection> {
        let opened = match target {
            TransportTarget::Process {
                command,
                args,
                envs,
            } => open_process(server_id, command, args, envs)?,
            TransportTarget::EventStream {
                url,
                token,
                headers,
                proxy,
            } => {
                let options = EventStreamOptions {
                    token: token.clone(),
                    headers: headers.clone(),
                    proxy: proxy.clone(),
                    connect_timeout: Some(self.http_connect_timeout),
                };
                open_event_stream(server_id, url, &options).await?
            }
        };

        let mut bundle = ResourceBundle::new(server_id);
        bundle.push(opened.handle);

        let session: Arc<dyn ToolSession> = Arc::new(RmcpSession::new(server_id, opened.channel));
        bundle.push(Box::new(SessionReleaser::new(Arc::clone(&session))));

        Ok(Connection { session, bundle })
    }
}
