use std::sync::Arc;

use parking_lot::RwLock;
use parley_protocol::{CallHistoryRecord, MessageCrypto};
use parley_voice::Role;
use serde::Serialize;
use tokio::time::Instant;

/// The logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub user_id: String,
    pub display_name: String,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Call status as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    #[default]
    Idle,
    /// Outgoing call waiting for the callee to pick up.
    Calling,
    /// Incoming call waiting for the local user.
    Ringing,
    Connecting,
    Connected,
    Ended,
}

/// The one active call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// Assigned by the relay; `None` until `voice-call:initiated` arrives.
    pub call_id: Option<String>,
    pub role: Role,
    pub peer_id: String,
    pub peer_name: String,
    pub conversation_id: Option<String>,
    pub status: CallStatus,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub duration_secs: u64,
    pub is_encrypted: bool,
    #[serde(skip)]
    pub connected_at: Option<Instant>,
}

impl CallSession {
    pub fn new(role: Role, peer_id: &str, peer_name: &str, status: CallStatus) -> Self {
        Self {
            call_id: None,
            role,
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            conversation_id: None,
            status,
            is_muted: false,
            is_speaker_on: false,
            duration_secs: 0,
            is_encrypted: true,
            connected_at: None,
        }
    }

    /// Seconds since the call connected, zero before that.
    pub fn elapsed_secs(&self) -> u64 {
        self.connected_at.map_or(0, |t| t.elapsed().as_secs())
    }
}

/// State shared between the session and call services.
#[derive(Default)]
pub struct AppState {
    /// Set on login, cleared on logout.
    pub user: RwLock<Option<UserSession>>,
    /// Crypto context for the logged-in user.
    pub crypto: RwLock<Option<Arc<MessageCrypto>>>,
    /// Most recent page of call history, newest first.
    pub history: RwLock<Vec<CallHistoryRecord>>,
}

pub type SharedState = Arc<AppState>;
