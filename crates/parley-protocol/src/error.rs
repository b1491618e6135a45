use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer {0} has not published a public key")]
    PeerKeyUnavailable(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] parley_crypto::CryptoError),

    #[error("http error: {0}")]
    Http(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("malformed signal: {0}")]
    MalformedSignal(String),
}

impl ProtocolError {
    /// Tag mismatch while decrypting; the peer key may be stale.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_integrity_failure())
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
