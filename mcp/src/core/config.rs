//! MCP configuration types and utilities.
//!
//! Defines the server registry (which tool servers to connect and how), the
//! manager timeouts and the HTTP proxy settings used by event-stream transports.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::transport::TransportTarget;

/// Registry of tool servers, loaded from YAML or JSON.
///
/// Accepts both the native layout (`servers:`) and the `mcpServers` layout used
/// by agent configuration files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerRegistryConfig {
    /// Master switch; when false nothing is connected.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Servers keyed by server id. Ordered so startup is reproducible.
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Global proxy for event-stream servers. Can be overridden per server.
    #[serde(default)]
    pub proxy: Option<McpProxyConfig>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for ServerRegistryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: BTreeMap::new(),
            proxy: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub transport: McpTransport,

    /// Per-server proxy override (overrides global proxy)
    #[serde(default)]
    pub proxy: Option<McpProxyConfig>,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        /// Bearer token for Authorization header
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl fmt::Debug for McpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpTransport::Stdio {
                command,
                args,
                envs,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
            McpTransport::Sse {
                url,
                token,
                headers,
            } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// MCP-specific proxy configuration for event-stream servers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpProxyConfig {
    /// HTTP proxy URL (e.g., "http://proxy.internal:8080")
    pub http: Option<String>,

    /// HTTPS proxy URL
    pub https: Option<String>,

    /// Comma-separated hosts to exclude from proxying
    pub no_proxy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Ceilings for the connect and teardown brackets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Whole connect bracket: open, handshake and discovery (seconds)
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Graceful session shutdown before force-release (seconds)
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,

    /// Release of each resource-bundle entry (seconds)
    #[serde(default = "default_release_secs")]
    pub release_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_connect_secs() -> u64 {
    30
}

fn default_shutdown_secs() -> u64 {
    5
}

fn default_release_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            shutdown_secs: default_shutdown_secs(),
            release_secs: default_release_secs(),
        }
    }
}

/// Runtime settings for [`McpClientManager`](super::manager::McpClientManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub release_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        TimeoutConfig::default().into()
    }
}

impl From<TimeoutConfig> for ManagerConfig {
    fn from(cfg: TimeoutConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(cfg.connect_secs),
            shutdown_timeout: Duration::from_secs(cfg.shutdown_secs),
            release_timeout: Duration::from_secs(cfg.release_secs),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("server '{0}': command must not be empty")]
    EmptyCommand(String),

    #[error("server '{server}': invalid url '{url}': {reason}")]
    InvalidUrl {
        server: String,
        url: String,
        reason: String,
    },

    #[error("server id must not be empty")]
    EmptyServerId,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
}

impl McpProxyConfig {
    /// Load proxy config from standard environment variables
    pub fn from_env() -> Option<Self> {
        let http = std::env::var("MCP_HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTP_PROXY").ok());

        let https = std::env::var("MCP_HTTPS_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTPS_PROXY").ok());

        let no_proxy = std::env::var("MCP_NO_PROXY")
            .ok()
            .or_else(|| std::env::var("NO_PROXY").ok());

        if http.is_some() || https.is_some() {
            Some(Self {
                http,
                https,
                no_proxy,
                username: None,
                password: None,
            })
        } else {
            None
        }
    }
}

impl ServerConfig {
    /// Transport target for this server, with the effective proxy applied.
    ///
    /// Priority: server proxy > global proxy > none.
    pub fn target(&self, global_proxy: Option<&McpProxyConfig>) -> TransportTarget {
        match &self.transport {
            McpTransport::Stdio {
                command,
                args,
                envs,
            } => TransportTarget::Process {
                command: command.clone(),
                args: args.clone(),
                envs: envs.clone(),
            },
            McpTransport::Sse {
                url,
                token,
                headers,
            } => TransportTarget::EventStream {
                url: url.clone(),
                token: token.clone(),
                headers: headers.clone(),
                proxy: self.proxy.clone().or_else(|| global_proxy.cloned()),
            },
        }
    }
}

impl ServerRegistryConfig {
    /// Load the registry from a file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigLoadError::Read {
                path: display.clone(),
                source,
            })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: Self = if is_json {
            serde_json::from_str(&content).map_err(|e| ConfigLoadError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| ConfigLoadError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Merge with environment-based proxy config
    pub fn with_env_proxy(mut self) -> Self {
        if self.proxy.is_none() {
            self.proxy = McpProxyConfig::from_env();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for (id, server) in &self.servers {
            if id.trim().is_empty() {
                return Err(ConfigValidationError::EmptyServerId);
            }
            match &server.transport {
                McpTransport::Stdio { command, .. } => {
                    if command.trim().is_empty() {
                        return Err(ConfigValidationError::EmptyCommand(id.clone()));
                    }
                }
                McpTransport::Sse { url, .. } => validate_http_url(id, url)?,
            }
        }
        Ok(())
    }

    /// Enabled servers in id order. Empty when the registry itself is disabled.
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        let master = self.enabled;
        self.servers
            .iter()
            .filter(move |(_, server)| master && server.enabled)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        self.timeouts.clone().into()
    }
}

fn validate_http_url(server: &str, raw: &str) -> Result<(), ConfigValidationError> {
    let invalid = |reason: String| ConfigValidationError::InvalidUrl {
        server: server.to_string(),
        url: raw.to_string(),
        reason,
    };

    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}
