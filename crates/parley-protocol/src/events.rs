//! Named realtime events and their JSON payloads.
//!
//! The relay is a plain pub/sub channel: every message is an event name plus a
//! camelCase JSON object. Inbound events are parsed once into
//! [`InboundEvent`]; outbound events are built as [`OutboundEvent`] and
//! flattened with [`OutboundEvent::to_payload`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::signaling::SignalMessage;

/// Event names used on the relay.
pub mod event {
    pub const JOIN: &str = "join";
    pub const USER_ONLINE: &str = "userOnline";
    pub const USER_STATUS_CHANGED: &str = "userStatusChanged";

    pub const CALL_INITIATE: &str = "voice-call:initiate";
    pub const CALL_INITIATED: &str = "voice-call:initiated";
    pub const CALL_INCOMING: &str = "voice-call:incoming";
    pub const CALL_ACCEPT: &str = "voice-call:accept";
    pub const CALL_ACCEPTED: &str = "voice-call:accepted";
    pub const CALL_DECLINE: &str = "voice-call:decline";
    pub const CALL_DECLINED: &str = "voice-call:declined";
    pub const CALL_END: &str = "voice-call:end";
    pub const CALL_ENDED: &str = "voice-call:ended";
    pub const CALL_ERROR: &str = "voice-call:error";

    pub const CALL_OFFER: &str = "voice-call:offer";
    pub const CALL_ANSWER: &str = "voice-call:answer";
    pub const CALL_ICE_CANDIDATE: &str = "voice-call:ice-candidate";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnline {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChanged {
    pub user_id: String,
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiate {
    pub caller_id: String,
    pub receiver_id: String,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiated {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIncoming {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAccept {
    pub call_id: String,
    pub receiver_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAccepted {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDecline {
    pub call_id: String,
    pub receiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_timeout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDeclined {
    pub call_id: String,
    #[serde(default)]
    pub is_timeout: Option<bool>,
    /// `"missed"` or `"declined"` as classified by the backend.
    #[serde(default)]
    pub status: Option<String>,
}

impl CallDeclined {
    pub fn is_missed(&self) -> bool {
        self.is_timeout == Some(true) || self.status.as_deref() == Some("missed")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnd {
    pub call_id: String,
    pub user_id: String,
    /// Seconds connected.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallErrorEvent {
    pub message: String,
}

/// An event received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    UserStatusChanged(UserStatusChanged),
    CallInitiated(CallInitiated),
    CallIncoming(CallIncoming),
    CallAccepted(CallAccepted),
    CallDeclined(CallDeclined),
    CallEnded(CallEnded),
    CallError(CallErrorEvent),
    Offer(SignalMessage),
    Answer(SignalMessage),
    IceCandidate(SignalMessage),
}

impl InboundEvent {
    /// Parse a named event. Names the client never receives are rejected
    /// with [`ProtocolError::UnknownEvent`].
    pub fn parse(name: &str, payload: Value) -> Result<Self, ProtocolError> {
        fn de<T: serde::de::DeserializeOwned>(name: &str, v: Value) -> Result<T, ProtocolError> {
            serde_json::from_value(v)
                .map_err(|e| ProtocolError::Deserialization(format!("{name}: {e}")))
        }

        Ok(match name {
            event::USER_STATUS_CHANGED => Self::UserStatusChanged(de(name, payload)?),
            event::CALL_INITIATED => Self::CallInitiated(de(name, payload)?),
            event::CALL_INCOMING => Self::CallIncoming(de(name, payload)?),
            event::CALL_ACCEPTED => Self::CallAccepted(de(name, payload)?),
            event::CALL_DECLINED => Self::CallDeclined(de(name, payload)?),
            event::CALL_ENDED => Self::CallEnded(de(name, payload)?),
            event::CALL_ERROR => Self::CallError(de(name, payload)?),
            event::CALL_OFFER => Self::Offer(de(name, payload)?),
            event::CALL_ANSWER => Self::Answer(de(name, payload)?),
            event::CALL_ICE_CANDIDATE => Self::IceCandidate(de(name, payload)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        })
    }

    /// Call id this event belongs to, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::UserStatusChanged(_) | Self::CallError(_) => None,
            Self::CallInitiated(e) => Some(&e.call_id),
            Self::CallIncoming(e) => Some(&e.call_id),
            Self::CallAccepted(e) => Some(&e.call_id),
            Self::CallDeclined(e) => Some(&e.call_id),
            Self::CallEnded(e) => Some(&e.call_id),
            Self::Offer(m) | Self::Answer(m) | Self::IceCandidate(m) => Some(&m.call_id),
        }
    }
}

/// An event the client sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Join(JoinRoom),
    UserOnline(UserOnline),
    CallInitiate(CallInitiate),
    CallAccept(CallAccept),
    CallDecline(CallDecline),
    CallEnd(CallEnd),
    Offer(SignalMessage),
    Answer(SignalMessage),
    IceCandidate(SignalMessage),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => event::JOIN,
            Self::UserOnline(_) => event::USER_ONLINE,
            Self::CallInitiate(_) => event::CALL_INITIATE,
            Self::CallAccept(_) => event::CALL_ACCEPT,
            Self::CallDecline(_) => event::CALL_DECLINE,
            Self::CallEnd(_) => event::CALL_END,
            Self::Offer(_) => event::CALL_OFFER,
            Self::Answer(_) => event::CALL_ANSWER,
            Self::IceCandidate(_) => event::CALL_ICE_CANDIDATE,
        }
    }

    pub fn to_payload(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            Self::Join(p) => serde_json::to_value(p),
            Self::UserOnline(p) => serde_json::to_value(p),
            Self::CallInitiate(p) => serde_json::to_value(p),
            Self::CallAccept(p) => serde_json::to_value(p),
            Self::CallDecline(p) => serde_json::to_value(p),
            Self::CallEnd(p) => serde_json::to_value(p),
            Self::Offer(m) | Self::Answer(m) | Self::IceCandidate(m) => serde_json::to_value(m),
        };
        value.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
