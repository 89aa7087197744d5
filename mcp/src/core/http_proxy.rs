//! HTTP client construction for event-stream servers.
//!
//! Applies proxy settings, bearer auth and custom headers to a reqwest client.
//! Only a connect timeout is set: event streams stay idle for long stretches
//! and must not be cut by a whole-request timeout.

use std::{collections::HashMap, time::Duration};

use thiserror::Error;

use super::config::McpProxyConfig;

/// Reasons an HTTP client could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum HttpClientError {
    #[error("invalid proxy: {0}")]
    Proxy(String),
    #[error("invalid header: {0}")]
    Header(String),
    #[error("build HTTP client: {0}")]
    Build(String),
}

fn proxy_with_options(mut proxy: reqwest::Proxy, proxy_cfg: &McpProxyConfig) -> reqwest::Proxy {
    if let Some(ref no_proxy) = proxy_cfg.no_proxy {
        proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
    }
    if let (Some(ref username), Some(ref password)) = (&proxy_cfg.username, &proxy_cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }
    proxy
}

/// Apply proxy configuration to a ClientBuilder without building it, so auth
/// headers can still be added afterwards.
pub(crate) fn apply_proxy_to_builder(
    mut builder: reqwest::ClientBuilder,
    proxy_cfg: &McpProxyConfig,
) -> Result<reqwest::ClientBuilder, HttpClientError> {
    if let Some(ref http_proxy) = proxy_cfg.http {
        let proxy = reqwest::Proxy::http(http_proxy)
            .map_err(|e| HttpClientError::Proxy(format!("HTTP proxy: {}", e)))?;
        builder = builder.proxy(proxy_with_options(proxy, proxy_cfg));
    }

    if let Some(ref https_proxy) = proxy_cfg.https {
        let proxy = reqwest::Proxy::https(https_proxy)
            .map_err(|e| HttpClientError::Proxy(format!("HTTPS proxy: {}", e)))?;
        builder = builder.proxy(proxy_with_options(proxy, proxy_cfg));
    }

    Ok(builder)
}

fn build_request_headers(
    token: Option<&str>,
    custom_headers: &HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, HttpClientError> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| HttpClientError::Header(format!("auth token: {}", e)))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| HttpClientError::Header(format!("name '{}': {}", key, e)))?,
            value
                .parse()
                .map_err(|e| HttpClientError::Header(format!("value for '{}': {}", key, e)))?,
        );
    }

    Ok(headers)
}

/// Build the HTTP client used by one event-stream connection.
pub(crate) fn build_http_client(
    connect_timeout: Duration,
    proxy_config: Option<&McpProxyConfig>,
    token: Option<&str>,
    custom_headers: &HashMap<String, String>,
) -> Result<reqwest::Client, HttpClientError> {
    let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);

    if let Some(proxy_cfg) = proxy_config {
        builder = apply_proxy_to_builder(builder, proxy_cfg)?;
    }

    let req_headers = build_request_headers(token, custom_headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| HttpClientError::Build(e.to_string()))
}
