use parley_protocol::ProtocolError;
use parley_voice::VoiceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("not logged in")]
    NotLoggedIn,

    #[error("cannot call yourself")]
    SelfCall,

    #[error("another call is already in progress")]
    Busy,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("no active call")]
    NoActiveCall,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Voice(#[from] VoiceError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("already logged in as {0}")]
    AlreadyLoggedIn(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no API token configured")]
    MissingToken,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
