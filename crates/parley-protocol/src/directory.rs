use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::api::KeyDirectory;
use crate::error::ProtocolError;

/// Local cache of peers' published public keys.
///
/// Entries can go stale when a peer rotates keys. A decryption failure is the
/// signal to [`invalidate`](Self::invalidate) and refetch.
pub struct PeerKeyCache {
    directory: Arc<dyn KeyDirectory>,
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl PeerKeyCache {
    pub fn new(directory: Arc<dyn KeyDirectory>) -> Self {
        Self {
            directory,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Arc<dyn KeyDirectory> {
        &self.directory
    }

    /// Cached key for `peer_id`, fetching it from the directory on a miss.
    pub async fn get_public_key(&self, peer_id: &str) -> Result<Vec<u8>, ProtocolError> {
        if let Some(key) = self.cached(peer_id) {
            return Ok(key);
        }

        let key = self
            .directory
            .fetch_public_key(peer_id)
            .await?
            .ok_or_else(|| ProtocolError::PeerKeyUnavailable(peer_id.to_string()))?;

        tracing::debug!(peer = %peer_id, "cached peer public key");
        self.keys.write().insert(peer_id.to_string(), key.clone());
        Ok(key)
    }

    pub fn cached(&self, peer_id: &str) -> Option<Vec<u8>> {
        self.keys.read().get(peer_id).cloned()
    }

    pub fn invalidate(&self, peer_id: &str) {
        if self.keys.write().remove(peer_id).is_some() {
            tracing::debug!(peer = %peer_id, "peer public key invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.keys.write().clear();
    }
}
