//! Per-login encryption context for chat messages and call signaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use parley_crypto::exchange::PUBLIC_KEY_LEN;
use parley_crypto::{EncryptedEnvelope, KeyExchangeService, Keychain, SealedPayload, SharedKey};

use crate::api::KeyDirectory;
use crate::directory::PeerKeyCache;
use crate::error::ProtocolError;

/// Encrypts and decrypts payloads exchanged with individual peers.
///
/// Constructed at login for one owner, torn down with [`logout`] or
/// [`destroy_keys`]. The key pair is created or restored lazily on first use,
/// and the owner's directory record is checked against it at that point.
///
/// [`logout`]: MessageCrypto::logout
/// [`destroy_keys`]: MessageCrypto::destroy_keys
pub struct MessageCrypto {
    owner_id: String,
    keychain: Arc<dyn Keychain>,
    peers: PeerKeyCache,
    exchange: Mutex<KeyExchangeService>,
    init_lock: tokio::sync::Mutex<()>,
    ready: AtomicBool,
}

impl MessageCrypto {
    pub fn new(
        owner_id: impl Into<String>,
        keychain: Arc<dyn Keychain>,
        directory: Arc<dyn KeyDirectory>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            keychain,
            peers: PeerKeyCache::new(directory),
            exchange: Mutex::new(KeyExchangeService::new()),
            init_lock: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn peers(&self) -> &PeerKeyCache {
        &self.peers
    }

    /// Local public key, if the key pair is loaded.
    pub fn public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.exchange.lock().export_public_key().ok()
    }

    /// Load or generate the key pair and make sure the directory has it.
    ///
    /// Runs at most once per login even with concurrent callers.
    pub async fn ensure_initialized(&self) -> Result<(), ProtocolError> {
        if self.is_initialized() {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let public = {
            let mut exchange = self.exchange.lock();
            if !exchange.is_initialized()
                && !exchange.load_key_pair(&self.owner_id, self.keychain.as_ref())?
            {
                exchange.initialize()?;
                exchange.save_key_pair(&self.owner_id, self.keychain.as_ref())?;
            }
            exchange.export_public_key()?
        };

        let directory = self.peers.directory();
        let published = directory.fetch_public_key(&self.owner_id).await?;
        if published.as_deref() != Some(public.as_slice()) {
            tracing::info!(
                owner = %self.owner_id,
                missing = published.is_none(),
                "publishing public key"
            );
            directory.publish_public_key(&public).await?;
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn shared_key(&self, peer_id: &str) -> Result<SharedKey, ProtocolError> {
        let peer_public = self.peers.get_public_key(peer_id).await?;
        let key = self.exchange.lock().derive_shared_key(&peer_public, peer_id)?;
        Ok(key)
    }

    pub async fn encrypt_for_peer(
        &self,
        plaintext: &[u8],
        peer_id: &str,
    ) -> Result<EncryptedEnvelope, ProtocolError> {
        self.ensure_initialized().await?;
        let key = self.shared_key(peer_id).await?;
        Ok(KeyExchangeService::encrypt(plaintext, &key)?)
    }

    /// Decrypt a peer's envelope.
    ///
    /// A tag mismatch may mean the cached peer key is stale, so the key and
    /// derived secret are dropped and the decryption is retried once.
    pub async fn decrypt_from_peer(
        &self,
        envelope: &EncryptedEnvelope,
        peer_id: &str,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_initialized().await?;
        let key = self.shared_key(peer_id).await?;
        match KeyExchangeService::decrypt(envelope, &key) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) if e.is_integrity_failure() => {
                tracing::warn!(peer = %peer_id, "decryption failed, refreshing peer key");
                self.invalidate_peer(peer_id);
                let key = self.shared_key(peer_id).await?;
                Ok(KeyExchangeService::decrypt(envelope, &key)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt when possible, otherwise hand the plaintext back marked clear.
    pub async fn seal_for_peer(&self, plaintext: &str, peer_id: &str) -> SealedPayload {
        match self.encrypt_for_peer(plaintext.as_bytes(), peer_id).await {
            Ok(envelope) => SealedPayload::Encrypted(envelope),
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "sending without end-to-end encryption");
                SealedPayload::Clear(plaintext.to_string())
            }
        }
    }

    pub async fn open_from_peer(
        &self,
        sealed: &SealedPayload,
        peer_id: &str,
    ) -> Result<Vec<u8>, ProtocolError> {
        match sealed {
            SealedPayload::Encrypted(envelope) => self.decrypt_from_peer(envelope, peer_id).await,
            SealedPayload::Clear(text) => Ok(text.as_bytes().to_vec()),
        }
    }

    /// Drop the cached public key and shared secret for one peer.
    pub fn invalidate_peer(&self, peer_id: &str) {
        self.peers.invalidate(peer_id);
        self.exchange.lock().invalidate_peer(peer_id);
    }

    /// Forget in-memory keys. The persisted key pair stays for the next login.
    pub fn logout(&self) {
        self.exchange.lock().clear_in_memory();
        self.peers.invalidate_all();
        self.ready.store(false, Ordering::Release);
        tracing::info!(owner = %self.owner_id, "crypto context cleared");
    }

    /// Delete the persisted key pair. Older ciphertext becomes unreadable.
    pub fn destroy_keys(&self) -> Result<(), ProtocolError> {
        self.exchange
            .lock()
            .delete_key_pair(&self.owner_id, self.keychain.as_ref())?;
        self.logout();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;
    use parley_crypto::MemoryKeychain;

    fn context(backend: &MemoryBackend, user: &str, keychain: Arc<MemoryKeychain>) -> MessageCrypto {
        MessageCrypto::new(user, keychain, Arc::new(backend.session(user)))
    }

    fn fresh(backend: &MemoryBackend, user: &str) -> MessageCrypto {
        context(backend, user, Arc::new(MemoryKeychain::new()))
    }

    #[tokio::test]
    async fn first_use_generates_and_publishes() {
        let backend = MemoryBackend::new();
        let alice = fresh(&backend, "alice");
        let bob = fresh(&backend, "bob");
        bob.ensure_initialized().await.unwrap();

        assert!(!alice.is_initialized());
        let envelope = alice.encrypt_for_peer(b"hi bob", "bob").await.unwrap();
        assert!(alice.is_initialized());
        assert_eq!(backend.publishes("alice"), 1);
        assert_eq!(
            backend.public_key("alice").unwrap(),
            alice.public_key().unwrap().to_vec()
        );

        assert_eq!(bob.decrypt_from_peer(&envelope, "alice").await.unwrap(), b"hi bob");
    }

    #[tokio::test]
    async fn concurrent_callers_initialize_once() {
        let backend = MemoryBackend::new();
        let alice = fresh(&backend, "alice");
        let (a, b, c) = tokio::join!(
            alice.ensure_initialized(),
            alice.ensure_initialized(),
            alice.ensure_initialized()
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert_eq!(backend.publishes("alice"), 1);
    }

    #[tokio::test]
    async fn persisted_key_is_republished_after_directory_loss() {
        let backend = MemoryBackend::new();
        let keychain = Arc::new(MemoryKeychain::new());
        let first = context(&backend, "alice", keychain.clone());
        first.ensure_initialized().await.unwrap();
        let public = first.public_key().unwrap();

        backend.remove_public_key("alice");
        let second = context(&backend, "alice", keychain);
        second.ensure_initialized().await.unwrap();

        assert_eq!(second.public_key().unwrap(), public);
        assert_eq!(backend.public_key("alice").unwrap(), public.to_vec());
        assert_eq!(backend.publishes("alice"), 2);
    }

    #[tokio::test]
    async fn matching_record_is_not_republished() {
        let backend = MemoryBackend::new();
        let keychain = Arc::new(MemoryKeychain::new());
        context(&backend, "alice", keychain.clone())
            .ensure_initialized()
            .await
            .unwrap();
        context(&backend, "alice", keychain)
            .ensure_initialized()
            .await
            .unwrap();
        assert_eq!(backend.publishes("alice"), 1);
    }

    #[tokio::test]
    async fn peer_without_key_degrades_to_clear() {
        let backend = MemoryBackend::new();
        let alice = fresh(&backend, "alice");

        let err = alice.encrypt_for_peer(b"x", "bob").await.unwrap_err();
        assert!(matches!(err, ProtocolError::PeerKeyUnavailable(_)));

        let sealed = alice.seal_for_peer("plain text", "bob").await;
        assert_eq!(sealed, SealedPayload::Clear("plain text".into()));
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json, serde_json::json!({"encrypted": false, "data": "plain text"}));
        assert_eq!(alice.open_from_peer(&sealed, "bob").await.unwrap(), b"plain text");
    }

    #[tokio::test]
    async fn rotated_peer_key_is_refetched_once() {
        let backend = MemoryBackend::new();
        let alice = fresh(&backend, "alice");
        let bob = fresh(&backend, "bob");
        alice.ensure_initialized().await.unwrap();

        let first = bob.encrypt_for_peer(b"before", "alice").await.unwrap();
        assert_eq!(alice.decrypt_from_peer(&first, "bob").await.unwrap(), b"before");
        assert_eq!(backend.key_fetches("bob"), 2);

        // Bob loses his keys and starts over with a new pair
        bob.destroy_keys().unwrap();
        let second = bob.encrypt_for_peer(b"after", "alice").await.unwrap();

        assert_eq!(alice.decrypt_from_peer(&second, "bob").await.unwrap(), b"after");
        assert_eq!(alice.peers().cached("bob").unwrap(), bob.public_key().unwrap().to_vec());
    }

    #[tokio::test]
    async fn tampered_envelope_fails_after_single_retry() {
        let backend = MemoryBackend::new();
        let alice = fresh(&backend, "alice");
        let bob = fresh(&backend, "bob");
        alice.ensure_initialized().await.unwrap();

        let mut envelope = bob.encrypt_for_peer(b"payload", "alice").await.unwrap();
        envelope.auth_tag[0] ^= 0x01;
        let fetches_before = backend.key_fetches("bob");

        let err = alice.decrypt_from_peer(&envelope, "bob").await.unwrap_err();
        assert!(err.is_integrity_failure());
        // one fetch on the cold cache, one after invalidation
        assert_eq!(backend.key_fetches("bob"), fetches_before + 2);
    }

    #[tokio::test]
    async fn logout_keeps_keys_and_destroy_removes_them() {
        let backend = MemoryBackend::new();
        let keychain = Arc::new(MemoryKeychain::new());
        let alice = context(&backend, "alice", keychain.clone());
        alice.ensure_initialized().await.unwrap();
        let public = alice.public_key().unwrap();

        alice.logout();
        assert!(!alice.is_initialized());
        assert!(alice.public_key().is_none());
        alice.ensure_initialized().await.unwrap();
        assert_eq!(alice.public_key().unwrap(), public);

        alice.destroy_keys().unwrap();
        assert!(keychain.is_empty());
        alice.ensure_initialized().await.unwrap();
        assert_ne!(alice.public_key().unwrap(), public);
        assert_eq!(backend.public_key("alice").unwrap(), alice.public_key().unwrap().to_vec());
    }
}
