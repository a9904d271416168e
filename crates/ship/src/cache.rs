//! Adapter cache.
//!
//! Keyed by `(endpoint, container_id)` so a container recreated behind a
//! reused endpoint never inherits a stale meta cache. Entries are also
//! purged when the owning session is destroyed.

use std::sync::Arc;

use bay_common::Result;
use bay_config::RuntimeType;
use dashmap::DashMap;

use crate::client::ShipClient;

pub struct ShipCache {
    http: reqwest::Client,
    clients: DashMap<(String, String), Arc<ShipClient>>,
}

impl ShipCache {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            clients: DashMap::new(),
        }
    }

    pub fn get_or_create(
        &self,
        endpoint: &str,
        container_id: &str,
        runtime_type: RuntimeType,
    ) -> Result<Arc<ShipClient>> {
        let key = (endpoint.to_string(), container_id.to_string());
        if let Some(client) = self.clients.get(&key) {
            return Ok(Arc::clone(&client));
        }
        let client = Arc::new(ShipClient::new(
            self.http.clone(),
            endpoint,
            container_id,
            runtime_type,
        )?);
        self.clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Drop every adapter bound to this container.
    pub fn purge_container(&self, container_id: &str) {
        self.clients.retain(|(_, cid), _| cid != container_id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ShipCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn same_key_returns_same_client() {
        let cache = ShipCache::new();
        let a = cache
            .get_or_create("http://127.0.0.1:9000", "c1", RuntimeType::Code)
            .unwrap();
        let b = cache
            .get_or_create("http://127.0.0.1:9000", "c1", RuntimeType::Code)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn recreated_container_gets_a_fresh_client() {
        let cache = ShipCache::new();
        let old = cache
            .get_or_create("http://127.0.0.1:9000", "c1", RuntimeType::Code)
            .unwrap();
        // Same endpoint, new container id: distinct cache entry.
        let new = cache
            .get_or_create("http://127.0.0.1:9000", "c2", RuntimeType::Code)
            .unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn purge_container_drops_all_entries_for_it() {
        let cache = ShipCache::new();
        cache
            .get_or_create("http://127.0.0.1:9000", "c1", RuntimeType::Code)
            .unwrap();
        cache
            .get_or_create("http://127.0.0.1:9001", "c1", RuntimeType::Browser)
            .unwrap();
        cache
            .get_or_create("http://127.0.0.1:9002", "c2", RuntimeType::Code)
            .unwrap();
        cache.purge_container("c1");
        assert_eq!(cache.len(), 1);
    }
}
