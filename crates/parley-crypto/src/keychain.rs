use crate::CryptoError;

/// Key storage, abstracted over the actual backend.
///
/// The client implements this with a file-backed store; tests use
/// [`MemoryKeychain`](crate::MemoryKeychain). The crypto crate has no
/// filesystem dependency; it only defines the trait.
pub trait Keychain: Send + Sync {
    /// Write `data` under `vault`/`key`, replacing any previous value.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// `None` when nothing is stored there.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Deleting a missing key is not an error.
    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self.load_key(vault, key)?.is_some())
    }
}

/// Vault for end-to-end encryption key pairs.
pub const VAULT_ENCRYPTION: &str = "encryption";

/// Key name under which an owner's X25519 private key is stored.
pub fn ecdh_key_name(owner_id: &str) -> String {
    format!("ecdh_{owner_id}")
}
