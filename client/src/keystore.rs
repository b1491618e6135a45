use std::path::{Path, PathBuf};

use iota_stronghold::{KeyProvider, SnapshotPath, Stronghold};
use parking_lot::Mutex;
use parley_crypto::{CryptoError, Keychain};
use zeroize::Zeroizing;

const CLIENT_NAME: &[u8] = b"parley";

/// Passphrase-sealed keychain backed by a Stronghold snapshot.
///
/// Each user gets `<dir>/<user_id>.stronghold`, encrypted with an
/// `Argon2id` key derived from the passphrase. Every write is committed to
/// disk before returning.
pub struct StrongholdKeychain {
    snapshot_file: PathBuf,
    inner: Mutex<Snapshot>,
}

struct Snapshot {
    stronghold: Stronghold,
    path: SnapshotPath,
    keyprovider: KeyProvider,
}

fn storage(what: &str, e: impl std::fmt::Display) -> CryptoError {
    CryptoError::StorageError(format!("{what}: {e}"))
}

impl StrongholdKeychain {
    /// Unlock (or create) the snapshot for `user_id` under `dir`.
    ///
    /// Fails when an existing snapshot does not open with `passphrase`.
    pub fn open(dir: &Path, user_id: &str, passphrase: &str) -> Result<Self, CryptoError> {
        let valid = !user_id.is_empty()
            && user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CryptoError::StorageError(format!(
                "invalid keychain owner: {user_id:?}"
            )));
        }
        std::fs::create_dir_all(dir)
            .map_err(|e| CryptoError::StorageError(format!("create {}: {e}", dir.display())))?;

        let snapshot_file = dir.join(format!("{user_id}.stronghold"));
        let key = derive_key(passphrase, user_id)?;
        let keyprovider = KeyProvider::try_from(key)
            .map_err(|e| CryptoError::StorageError(format!("key provider: {e:?}")))?;
        let path = SnapshotPath::from_path(&snapshot_file);

        let stronghold = Stronghold::default();
        if snapshot_file.exists() {
            stronghold
                .load_snapshot(&keyprovider, &path)
                .map_err(|e| storage("unlock snapshot", e))?;
        }
        stronghold
            .load_client(CLIENT_NAME)
            .or_else(|_| stronghold.create_client(CLIENT_NAME))
            .map_err(|e| storage("open client", e))?;

        tracing::debug!(path = %snapshot_file.display(), "keychain unlocked");
        Ok(Self {
            snapshot_file,
            inner: Mutex::new(Snapshot {
                stronghold,
                path,
                keyprovider,
            }),
        })
    }

    pub fn snapshot_file(&self) -> &Path {
        &self.snapshot_file
    }
}

impl Snapshot {
    fn commit(&self) -> Result<(), CryptoError> {
        self.stronghold
            .write_client(CLIENT_NAME)
            .map_err(|e| storage("write client", e))?;
        self.stronghold
            .commit_with_keyprovider(&self.path, &self.keyprovider)
            .map_err(|e| storage("commit snapshot", e))
    }
}

fn entry(vault: &str, key: &str) -> Vec<u8> {
    format!("{vault}/{key}").into_bytes()
}

impl Keychain for StrongholdKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        let snapshot = self.inner.lock();
        snapshot
            .stronghold
            .get_client(CLIENT_NAME)
            .map_err(|e| storage("get client", e))?
            .store()
            .insert(entry(vault, key), data.to_vec(), None)
            .map_err(|e| storage("store insert", e))?;
        snapshot.commit()
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.inner
            .lock()
            .stronghold
            .get_client(CLIENT_NAME)
            .map_err(|e| storage("get client", e))?
            .store()
            .get(&entry(vault, key))
            .map_err(|e| storage("store get", e))
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        let snapshot = self.inner.lock();
        snapshot
            .stronghold
            .get_client(CLIENT_NAME)
            .map_err(|e| storage("get client", e))?
            .store()
            .delete(&entry(vault, key))
            .map_err(|e| storage("store delete", e))?;
        snapshot.commit()
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        self.inner
            .lock()
            .stronghold
            .get_client(CLIENT_NAME)
            .map_err(|e| storage("get client", e))?
            .store()
            .contains_key(&entry(vault, key))
            .map_err(|e| storage("store contains", e))
    }
}

/// `Argon2id` snapshot key, salted per user.
///
/// Debug builds use cheap parameters so tests stay fast.
fn derive_key(passphrase: &str, user_id: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    #[cfg(debug_assertions)]
    let params = Params::new(256, 1, 1, Some(32));
    #[cfg(not(debug_assertions))]
    let params = Params::new(65536, 3, 4, Some(32));
    let params = params.map_err(|e| storage("argon2 params", e))?;

    let salt = format!("parley-keychain:{user_id}");
    let mut key = Zeroizing::new(vec![0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), key.as_mut_slice())
        .map_err(|e| storage("argon2", e))?;
    Ok(key)
}
