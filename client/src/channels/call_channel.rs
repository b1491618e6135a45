use serde::Serialize;

use crate::state::CallStatus;

/// Why a call session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// The local user hung up.
    Hangup,
    RemoteHangup,
    Declined,
    /// Nobody picked up before the ring timeout.
    Missed,
    Failed,
}

/// Events streamed to the UI for voice calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum CallEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        call_id: Option<String>,
        peer_id: String,
        status: CallStatus,
    },
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call_id: String,
        caller_id: String,
        caller_name: String,
    },
    /// The call is not end-to-end encrypted.
    #[serde(rename_all = "camelCase")]
    EncryptionChanged {
        encrypted: bool,
    },
    #[serde(rename_all = "camelCase")]
    DurationTick {
        seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    MuteChanged {
        muted: bool,
    },
    #[serde(rename_all = "camelCase")]
    SpeakerChanged {
        speaker_on: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallFailed {
        call_id: Option<String>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_id: Option<String>,
        reason: EndReason,
    },
    /// An incoming call was declined because another call is active.
    #[serde(rename_all = "camelCase")]
    BusyDeclined {
        call_id: String,
        caller_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Warning {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    HistoryUpdated {
        count: usize,
    },
}
