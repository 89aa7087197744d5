//! Per-server resource bundles.
//!
//! Every OS-level handle acquired while connecting a server (child process,
//! HTTP client, the session's force-release hook) is pushed onto the server's
//! [`ResourceBundle`]. The bundle is released as a unit in reverse
//! acquisition order, each entry under its own timeout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::TeardownWarning;

/// A releasable handle owned by one server connection.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Short name used in logs and warnings.
    fn label(&self) -> &str;

    /// Release the handle. Races with the remote end (already exited, already
    /// closed) come back as warnings.
    async fn release(self: Box<Self>) -> Result<(), TeardownWarning>;
}

/// LIFO stack of resources for one server.
pub struct ResourceBundle {
    server_id: String,
    entries: Vec<Box<dyn Resource>>,
}

impl ResourceBundle {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, resource: Box<dyn Resource>) {
        debug!(server = %self.server_id, resource = resource.label(), "Acquired resource");
        self.entries.push(resource);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels in acquisition order.
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.label().to_string()).collect()
    }

    /// Release every entry, most recently acquired first.
    ///
    /// Never stops early: a failing or hanging entry is recorded as a warning
    /// and the remaining entries are still released.
    pub async fn release_all(mut self, per_resource_timeout: Duration) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();

        while let Some(resource) = self.entries.pop() {
            let label = resource.label().to_string();
            match tokio::time::timeout(per_resource_timeout, resource.release()).await {
                Ok(Ok(())) => {
                    debug!(server = %self.server_id, resource = %label, "Released resource");
                }
                Ok(Err(warning)) => {
                    warn!(
                        server = %self.server_id,
                        resource = %label,
                        "Resource release race: {}",
                        warning
                    );
                    warnings.push(warning);
                }
                Err(_) => {
                    let warning = TeardownWarning::ReleaseTimedOut {
                        label,
                        timeout: per_resource_timeout,
                    };
                    warn!(server = %self.server_id, "{}", warning);
                    warnings.push(warning);
                }
            }
        }

        warnings
    }
}

impl std::fmt::Debug for ResourceBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBundle")
            .field("server_id", &self.server_id)
            .field("entries", &self.labels())
            .finish()
    }
}
