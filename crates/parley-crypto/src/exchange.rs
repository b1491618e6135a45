use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::envelope::EncryptedEnvelope;
use crate::error::CryptoError;
use crate::keychain::{ecdh_key_name, Keychain, VAULT_ENCRYPTION};

/// Length of a raw X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// AES-GCM nonce length (96 bits).
pub const IV_LEN: usize = 12;
/// AES-GCM tag length (128 bits).
pub const TAG_LEN: usize = 16;

const KDF_INFO: &[u8] = b"parley-ecdh-aes256gcm-v1";

/// Symmetric AES-256-GCM key shared with one peer.
///
/// Derived from an X25519 agreement between the local key pair and the
/// peer's published public key. Both sides derive the same key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SharedKey {
    key: [u8; 32],
}

impl SharedKey {
    /// Short, non-secret identifier for logs and equality checks in tests.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        hex::encode(&digest[..8])
    }

    /// Encrypt with a fresh random 96-bit IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        // aes-gcm appends the tag; split it off so it travels as its own field
        let auth_tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        Ok(EncryptedEnvelope {
            ciphertext,
            iv: iv.to_vec(),
            auth_tag,
        })
    }

    /// Decrypt an envelope. The tag check is the sole integrity check.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        if envelope.iv.len() != IV_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "iv must be {IV_LEN} bytes, got {}",
                envelope.iv.len()
            )));
        }
        if envelope.auth_tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "auth tag must be {TAG_LEN} bytes, got {}",
                envelope.auth_tag.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);

        cipher
            .decrypt(Nonce::from_slice(&envelope.iv), sealed.as_slice())
            .map_err(|_| CryptoError::IntegrityFailure)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

struct LocalKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl LocalKeyPair {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// A derived key remembered together with the exact peer key it came from.
struct CachedSecret {
    peer_public: [u8; PUBLIC_KEY_LEN],
    key: SharedKey,
}

/// Local key pair plus the per-peer shared-secret cache.
///
/// Owned by one login session. Logout calls [`clear_in_memory`]; only
/// [`delete_key_pair`] touches durable storage destructively.
///
/// [`clear_in_memory`]: KeyExchangeService::clear_in_memory
/// [`delete_key_pair`]: KeyExchangeService::delete_key_pair
#[derive(Default)]
pub struct KeyExchangeService {
    key_pair: Option<LocalKeyPair>,
    secrets: HashMap<String, CachedSecret>,
}

impl KeyExchangeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.key_pair.is_some()
    }

    /// Generate a fresh key pair.
    ///
    /// Fails with [`CryptoError::AlreadyInitialized`] when a pair is already
    /// loaded; call [`reset`](Self::reset) first to replace it.
    pub fn initialize(&mut self) -> Result<(), CryptoError> {
        if self.key_pair.is_some() {
            return Err(CryptoError::AlreadyInitialized);
        }
        self.key_pair = Some(LocalKeyPair::generate());
        self.secrets.clear();
        tracing::info!("generated new key agreement pair");
        Ok(())
    }

    /// Drop the in-memory key pair and every derived secret.
    pub fn reset(&mut self) {
        self.clear_in_memory();
    }

    /// Raw 32-byte public key for publication.
    pub fn export_public_key(&self) -> Result<[u8; PUBLIC_KEY_LEN], CryptoError> {
        let pair = self.key_pair.as_ref().ok_or(CryptoError::NotInitialized)?;
        Ok(pair.public.to_bytes())
    }

    /// Derive (or reuse) the shared key for `peer_id`.
    ///
    /// The cache is keyed by peer id and only hits when the cached entry was
    /// derived from bit-identical public key bytes.
    pub fn derive_shared_key(
        &mut self,
        peer_public: &[u8],
        peer_id: &str,
    ) -> Result<SharedKey, CryptoError> {
        let pair = self.key_pair.as_ref().ok_or(CryptoError::NotInitialized)?;

        let their_bytes: [u8; PUBLIC_KEY_LEN] = peer_public.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "peer public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                peer_public.len()
            ))
        })?;

        if let Some(cached) = self.secrets.get(peer_id) {
            if cached.peer_public == their_bytes {
                return Ok(cached.key.clone());
            }
            tracing::debug!(peer = %peer_id, "peer public key changed, re-deriving shared key");
        }

        let their_public = PublicKey::from(their_bytes);
        let shared = pair.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "peer public key is a low-order point".into(),
            ));
        }

        // Sort public keys so both parties produce the same info string
        let my_bytes = pair.public.as_bytes();
        let mut info = Vec::with_capacity(2 * PUBLIC_KEY_LEN + KDF_INFO.len());
        if my_bytes.as_slice() < their_bytes.as_slice() {
            info.extend_from_slice(my_bytes);
            info.extend_from_slice(&their_bytes);
        } else {
            info.extend_from_slice(&their_bytes);
            info.extend_from_slice(my_bytes);
        }
        info.extend_from_slice(KDF_INFO);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(&info, &mut key)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {e}")))?;

        let key = SharedKey { key };
        tracing::debug!(peer = %peer_id, fingerprint = %key.fingerprint(), "derived shared key");
        self.secrets.insert(
            peer_id.to_string(),
            CachedSecret {
                peer_public: their_bytes,
                key: key.clone(),
            },
        );
        Ok(key)
    }

    /// Forget the derived secret for one peer.
    pub fn invalidate_peer(&mut self, peer_id: &str) {
        if self.secrets.remove(peer_id).is_some() {
            tracing::debug!(peer = %peer_id, "shared key invalidated");
        }
    }

    /// Encrypt `plaintext` under `key`.
    pub fn encrypt(plaintext: &[u8], key: &SharedKey) -> Result<EncryptedEnvelope, CryptoError> {
        key.encrypt(plaintext)
    }

    /// Decrypt `envelope` under `key`, failing closed on tag mismatch.
    pub fn decrypt(envelope: &EncryptedEnvelope, key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
        key.decrypt(envelope)
    }

    /// Persist the private key for `owner_id`.
    pub fn save_key_pair(&self, owner_id: &str, keychain: &dyn Keychain) -> Result<(), CryptoError> {
        let pair = self.key_pair.as_ref().ok_or(CryptoError::NotInitialized)?;
        let mut secret = pair.secret.to_bytes();
        let result = keychain.store_key(VAULT_ENCRYPTION, &ecdh_key_name(owner_id), &secret);
        secret.zeroize();
        result
    }

    /// Restore a persisted key pair. Returns `false` when none is stored.
    pub fn load_key_pair(
        &mut self,
        owner_id: &str,
        keychain: &dyn Keychain,
    ) -> Result<bool, CryptoError> {
        let Some(mut stored) = keychain.load_key(VAULT_ENCRYPTION, &ecdh_key_name(owner_id))? else {
            return Ok(false);
        };

        let bytes: Result<[u8; 32], _> = stored.as_slice().try_into();
        stored.zeroize();
        let mut bytes = bytes.map_err(|_| {
            CryptoError::StorageError("stored key pair has wrong length".into())
        })?;

        self.key_pair = Some(LocalKeyPair::from_secret_bytes(bytes));
        bytes.zeroize();
        self.secrets.clear();
        tracing::info!(owner = %owner_id, "restored key agreement pair");
        Ok(true)
    }

    /// Permanently delete the stored key pair for `owner_id`.
    ///
    /// Ciphertext produced under the deleted key can no longer be decrypted.
    pub fn delete_key_pair(
        &mut self,
        owner_id: &str,
        keychain: &dyn Keychain,
    ) -> Result<(), CryptoError> {
        keychain.delete_key(VAULT_ENCRYPTION, &ecdh_key_name(owner_id))?;
        self.clear_in_memory();
        tracing::warn!(owner = %owner_id, "key agreement pair permanently deleted");
        Ok(())
    }

    /// Drop the key pair and derived secrets without touching storage.
    pub fn clear_in_memory(&mut self) {
        self.key_pair = None;
        self.secrets.clear();
    }
}
