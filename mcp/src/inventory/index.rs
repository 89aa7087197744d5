//! Snapshot registry of namespaced tools.
//!
//! Readers load the current map without locking. Writers publish a whole new
//! map per change (read-copy-update), so a lookup sees either all of a
//! server's tools or none of them.

use std::{collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use tracing::warn;

use crate::core::tool_proxy::ToolProxy;

type ToolMap = BTreeMap<String, Arc<ToolProxy>>;

pub struct ToolRegistry {
    tools: ArcSwap<ToolMap>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: ArcSwap::from_pointee(BTreeMap::new()),
        }
    }

    pub fn get(&self, local_name: &str) -> Option<Arc<ToolProxy>> {
        self.tools.load().get(local_name).cloned()
    }

    pub fn contains(&self, local_name: &str) -> bool {
        self.tools.load().contains_key(local_name)
    }

    pub fn len(&self) -> usize {
        self.tools.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.load().is_empty()
    }

    /// Current snapshot, ordered by local name.
    pub fn snapshot(&self) -> Arc<ToolMap> {
        self.tools.load_full()
    }

    /// Proxies owned by `server_id`, ordered by local name.
    pub fn tools_for_server(&self, server_id: &str) -> Vec<Arc<ToolProxy>> {
        self.tools
            .load()
            .values()
            .filter(|proxy| proxy.server_id() == server_id)
            .cloned()
            .collect()
    }

    /// Replace every entry of `server_id` with `proxies` in one swap.
    ///
    /// On a local-name collision with another server the newer entry wins.
    pub fn replace_server(&self, server_id: &str, proxies: Vec<ToolProxy>) -> usize {
        let proxies: Vec<Arc<ToolProxy>> = proxies.into_iter().map(Arc::new).collect();
        let count = proxies.len();

        let previous = self.tools.rcu(|current| {
            let mut next = ToolMap::clone(current);
            next.retain(|_, proxy| proxy.server_id() != server_id);
            for proxy in &proxies {
                next.insert(proxy.local_name().to_string(), Arc::clone(proxy));
            }
            next
        });

        for proxy in &proxies {
            if let Some(existing) = previous.get(proxy.local_name()) {
                if existing.server_id() != server_id {
                    warn!(
                        "Tool name collision: '{}' from '{}' replaces the one from '{}'",
                        proxy.local_name(),
                        server_id,
                        existing.server_id()
                    );
                }
            }
        }

        count
    }

    /// Remove every entry of `server_id` in one swap. Returns how many went.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let previous = self.tools.rcu(|current| {
            let mut next = ToolMap::clone(current);
            next.retain(|_, proxy| proxy.server_id() != server_id);
            next
        });
        previous
            .values()
            .filter(|proxy| proxy.server_id() == server_id)
            .count()
    }

}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
