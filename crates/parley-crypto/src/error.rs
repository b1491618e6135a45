use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key pair not initialized")]
    NotInitialized,

    #[error("key pair already initialized")]
    AlreadyInitialized,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("authentication tag mismatch")]
    IntegrityFailure,

    #[error("malformed envelope: {0}")]
    InvalidEnvelope(String),

    #[error("key storage error: {0}")]
    StorageError(String),
}

impl CryptoError {
    /// Whether this failure may be caused by a stale peer key.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::IntegrityFailure)
    }
}
