//! In-memory REST backend, suitable for testing and the headless demo.
//!
//! One [`MemoryBackend`] is shared by every simulated user; each user talks
//! to it through a [`MemoryBackendSession`] that plays the role of their
//! authenticated HTTP client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::{CallHistoryApi, CallHistoryRecord, KeyDirectory};
use crate::error::ProtocolError;

#[derive(Default)]
struct BackendInner {
    keys: HashMap<String, Vec<u8>>,
    history: Vec<CallHistoryRecord>,
    key_fetches: HashMap<String, usize>,
    publishes: HashMap<String, usize>,
    history_fetches: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client authenticated as `user_id`.
    pub fn session(&self, user_id: &str) -> MemoryBackendSession {
        MemoryBackendSession {
            backend: self.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn public_key(&self, user_id: &str) -> Option<Vec<u8>> {
        self.inner.lock().keys.get(user_id).cloned()
    }

    /// Overwrite a user's directory record directly.
    pub fn set_public_key(&self, user_id: &str, key: &[u8]) {
        self.inner.lock().keys.insert(user_id.to_string(), key.to_vec());
    }

    /// Simulate directory data loss for one user.
    pub fn remove_public_key(&self, user_id: &str) {
        self.inner.lock().keys.remove(user_id);
    }

    /// How many times anyone fetched `user_id`'s key.
    pub fn key_fetches(&self, user_id: &str) -> usize {
        self.inner.lock().key_fetches.get(user_id).copied().unwrap_or(0)
    }

    /// How many times `user_id` published their key.
    pub fn publishes(&self, user_id: &str) -> usize {
        self.inner.lock().publishes.get(user_id).copied().unwrap_or(0)
    }

    pub fn history_fetches(&self) -> usize {
        self.inner.lock().history_fetches
    }

    pub fn record_call(&self, record: CallHistoryRecord) {
        let mut inner = self.inner.lock();
        inner.history.retain(|r| r.id != record.id);
        inner.history.push(record);
    }

    pub fn history(&self) -> Vec<CallHistoryRecord> {
        self.inner.lock().history.clone()
    }
}

#[derive(Clone)]
pub struct MemoryBackendSession {
    backend: MemoryBackend,
    user_id: String,
}

impl MemoryBackendSession {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl KeyDirectory for MemoryBackendSession {
    async fn publish_public_key(&self, public_key: &[u8]) -> Result<(), ProtocolError> {
        let mut inner = self.backend.inner.lock();
        inner.keys.insert(self.user_id.clone(), public_key.to_vec());
        *inner.publishes.entry(self.user_id.clone()).or_default() += 1;
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut inner = self.backend.inner.lock();
        *inner.key_fetches.entry(user_id.to_string()).or_default() += 1;
        Ok(inner.keys.get(user_id).cloned())
    }
}

#[async_trait]
impl CallHistoryApi for MemoryBackendSession {
    async fn fetch_history(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CallHistoryRecord>, ProtocolError> {
        let mut inner = self.backend.inner.lock();
        inner.history_fetches += 1;
        // Newest first, like the real endpoint
        Ok(inner
            .history
            .iter()
            .rev()
            .filter(|r| r.involves(&self.user_id))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn delete_call(&self, call_id: &str) -> Result<(), ProtocolError> {
        let mut inner = self.backend.inner.lock();
        let user = &self.user_id;
        inner.history.retain(|r| !(r.id == call_id && r.involves(user)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CallHistoryStatus;

    fn record(id: &str, caller: &str, receiver: &str) -> CallHistoryRecord {
        CallHistoryRecord {
            id: id.into(),
            caller_id: caller.into(),
            receiver_id: receiver.into(),
            status: CallHistoryStatus::Completed,
            duration: 3,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn directory_counts_publishes_and_fetches() {
        let backend = MemoryBackend::new();
        let alice = backend.session("alice");
        let bob = backend.session("bob");

        assert_eq!(bob.fetch_public_key("alice").await.unwrap(), None);
        alice.publish_public_key(&[1; 32]).await.unwrap();
        assert_eq!(bob.fetch_public_key("alice").await.unwrap(), Some(vec![1; 32]));

        assert_eq!(backend.publishes("alice"), 1);
        assert_eq!(backend.key_fetches("alice"), 2);
    }

    #[tokio::test]
    async fn history_is_scoped_and_paged() {
        let backend = MemoryBackend::new();
        backend.record_call(record("call-1", "alice", "bob"));
        backend.record_call(record("call-2", "carol", "dave"));
        backend.record_call(record("call-3", "bob", "alice"));

        let alice = backend.session("alice");
        let page = alice.fetch_history(1, 0).await.unwrap();
        assert_eq!(page[0].id, "call-3");
        let page = alice.fetch_history(10, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "call-1");

        alice.delete_call("call-2").await.unwrap();
        alice.delete_call("call-1").await.unwrap();
        let ids: Vec<_> = backend.history().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["call-2", "call-3"]);
    }
}
