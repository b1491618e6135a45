use parley_protocol::ProtocolError;
use serde::Serialize;
use thiserror::Error;

use crate::state::SignalingState;

/// Why local audio could not be captured.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("invalid signaling transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SignalingState,
        to: SignalingState,
    },

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("signaling task has stopped")]
    Closed,
}

/// User-facing reason a call attempt ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum FailureReason {
    #[error("{0}")]
    Media(MediaError),

    #[error("no response")]
    NoResponse,

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("could not establish secure channel: {0}")]
    SecureChannel(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling transport error: {0}")]
    Transport(String),
}

impl From<VoiceError> for FailureReason {
    fn from(e: VoiceError) -> Self {
        match e {
            VoiceError::Media(m) => Self::Media(m),
            VoiceError::Protocol(p) => p.into(),
            other => Self::Negotiation(other.to_string()),
        }
    }
}

impl From<ProtocolError> for FailureReason {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Transport(msg) => Self::Transport(msg),
            other => Self::Negotiation(other.to_string()),
        }
    }
}
