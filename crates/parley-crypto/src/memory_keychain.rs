//! In-memory [`Keychain`] implementation.
//!
//! Suitable for tests and headless runs. Data is lost on process exit; the
//! client uses a file-backed keychain for durable storage.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::keychain::Keychain;
use crate::CryptoError;

#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all vaults.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .insert((vault.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(&(vault.to_string(), key.to_string()))
            .cloned())
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .remove(&(vault.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_delete() {
        let kc = MemoryKeychain::new();
        assert!(kc.load_key("v", "k").unwrap().is_none());

        kc.store_key("v", "k", b"secret").unwrap();
        assert_eq!(kc.load_key("v", "k").unwrap().unwrap(), b"secret");
        assert!(kc.key_exists("v", "k").unwrap());
        assert!(!kc.key_exists("other", "k").unwrap());

        kc.delete_key("v", "k").unwrap();
        assert!(kc.is_empty());
    }
}
