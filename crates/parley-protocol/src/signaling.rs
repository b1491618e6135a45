//! Wire format for WebRTC signaling messages.
//!
//! A signal travels as `{callId, from, to, encrypted, encryptedData?, offer? |
//! answer? | candidate?}`. Older clients put the description or candidate in
//! the clear field; newer ones put a sealed payload in `encryptedData`.
//! [`SignalMessage::payload`] classifies an inbound message once into a
//! [`SignalPayload`] so the rest of the stack never guesses at shapes.

use parley_crypto::{EncryptedEnvelope, SealedPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::events::event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP session description (`RTCSessionDescriptionInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    /// End-of-candidates marker: an empty candidate line.
    pub fn is_end_marker(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Offer => event::CALL_OFFER,
            Self::Answer => event::CALL_ANSWER,
            Self::IceCandidate => event::CALL_ICE_CANDIDATE,
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            event::CALL_OFFER => Some(Self::Offer),
            event::CALL_ANSWER => Some(Self::Answer),
            event::CALL_ICE_CANDIDATE => Some(Self::IceCandidate),
            _ => None,
        }
    }

    /// Name of the legacy clear-text field carrying this kind of body.
    fn legacy_field(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "candidate",
        }
    }
}

/// Decrypted content of a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    /// `None` is the end-of-candidates marker.
    Candidate(Option<IceCandidate>),
}

impl SignalBody {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::Candidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn to_json(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_value(desc),
            Self::Candidate(candidate) => serde_json::to_value(candidate),
        };
        value.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(kind: SignalKind, value: Value) -> Result<Self, ProtocolError> {
        let malformed = |e: serde_json::Error| ProtocolError::MalformedSignal(e.to_string());
        match kind {
            SignalKind::Offer => Ok(Self::Offer(serde_json::from_value(value).map_err(malformed)?)),
            SignalKind::Answer => Ok(Self::Answer(serde_json::from_value(value).map_err(malformed)?)),
            SignalKind::IceCandidate => {
                let candidate: Option<IceCandidate> =
                    serde_json::from_value(value).map_err(malformed)?;
                Ok(Self::Candidate(candidate.filter(|c| !c.is_end_marker())))
            }
        }
    }

    /// Parse the plaintext produced by decrypting a sealed body.
    pub fn from_plaintext(kind: SignalKind, plaintext: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(plaintext)
            .map_err(|e| ProtocolError::MalformedSignal(format!("plaintext is not JSON: {e}")))?;
        Self::from_json(kind, value)
    }

    /// JSON text that gets sealed for the peer.
    pub fn to_plaintext(&self) -> Result<String, ProtocolError> {
        Ok(self.to_json()?.to_string())
    }
}

/// An inbound signal after shape classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Encrypted { envelope: EncryptedEnvelope },
    Clear { body: SignalBody },
}

/// A signaling message as it appears on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub call_id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl SignalMessage {
    fn empty(call_id: &str, from: &str, to: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            encrypted: false,
            encrypted_data: None,
            offer: None,
            answer: None,
            candidate: None,
        }
    }

    /// Build an outbound signal from a sealed body.
    ///
    /// Encrypted bodies go in `encryptedData`; clear bodies go in the
    /// kind's plain field with `encrypted: false`.
    pub fn seal(
        call_id: &str,
        from: &str,
        to: &str,
        body: &SignalBody,
        sealed: SealedPayload,
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::empty(call_id, from, to);
        match sealed {
            SealedPayload::Encrypted(_) => {
                msg.encrypted = true;
                msg.encrypted_data = Some(
                    serde_json::to_value(&sealed)
                        .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
                );
            }
            SealedPayload::Clear(_) => {
                *msg.legacy_slot(body.kind()) = Some(body.to_json()?);
            }
        }
        Ok(msg)
    }

    fn legacy_slot(&mut self, kind: SignalKind) -> &mut Option<Value> {
        match kind {
            SignalKind::Offer => &mut self.offer,
            SignalKind::Answer => &mut self.answer,
            SignalKind::IceCandidate => &mut self.candidate,
        }
    }

    fn legacy_value(&self, kind: SignalKind) -> Option<&Value> {
        match kind {
            SignalKind::Offer => self.offer.as_ref(),
            SignalKind::Answer => self.answer.as_ref(),
            SignalKind::IceCandidate => self.candidate.as_ref(),
        }
    }

    /// Classify the message into encrypted or clear content.
    ///
    /// Accepted shapes, in order:
    /// 1. `encryptedData` holding a sealed envelope or a bare envelope
    /// 2. `encryptedData` holding `{encrypted: false, data: "<json>"}`
    /// 3. `encryptedData` holding the body object itself
    /// 4. the legacy `offer` / `answer` / `candidate` field
    pub fn payload(&self, kind: SignalKind) -> Result<SignalPayload, ProtocolError> {
        if let Some(data) = &self.encrypted_data {
            if let Ok(sealed) = serde_json::from_value::<SealedPayload>(data.clone()) {
                return match sealed {
                    SealedPayload::Encrypted(envelope) => Ok(SignalPayload::Encrypted { envelope }),
                    SealedPayload::Clear(text) => Ok(SignalPayload::Clear {
                        body: SignalBody::from_plaintext(kind, text.as_bytes())?,
                    }),
                };
            }
            if let Ok(envelope) = serde_json::from_value::<EncryptedEnvelope>(data.clone()) {
                return Ok(SignalPayload::Encrypted { envelope });
            }
            if let Ok(body) = SignalBody::from_json(kind, data.clone()) {
                return Ok(SignalPayload::Clear { body });
            }
        }

        if let Some(body) = self.clear_fallback(kind) {
            return Ok(SignalPayload::Clear { body });
        }

        // A null candidate is how browsers mark end-of-candidates
        if kind == SignalKind::IceCandidate
            && self.encrypted_data.is_none()
            && self.candidate.is_none()
        {
            return Ok(SignalPayload::Clear {
                body: SignalBody::Candidate(None),
            });
        }

        Err(ProtocolError::MalformedSignal(format!(
            "{} carries no usable {} payload",
            self.call_id,
            kind.legacy_field()
        )))
    }

    /// Clear-text body from the legacy field, if one is present and parses.
    ///
    /// Used when decryption of the sealed body fails.
    pub fn clear_fallback(&self, kind: SignalKind) -> Option<SignalBody> {
        let value = self.legacy_value(kind)?;
        let value = match value {
            // Some senders stringify the description before sending
            Value::String(text) => serde_json::from_str(text).ok()?,
            other => other.clone(),
        };
        SignalBody::from_json(kind, value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> EncryptedEnvelope {
        EncryptedEnvelope {
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 12],
            auth_tag: vec![5; 16],
        }
    }

    fn base(extra: Value) -> SignalMessage {
        let mut value = json!({"callId": "c1", "from": "a", "to": "b"});
        for (k, v) in extra.as_object().unwrap() {
            value[k] = v.clone();
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn seal_encrypted_uses_encrypted_data() {
        let body = SignalBody::Offer(SessionDescription::offer("v=0"));
        let msg = SignalMessage::seal("c1", "a", "b", &body, SealedPayload::Encrypted(envelope()))
            .unwrap();
        assert!(msg.encrypted);
        assert!(msg.offer.is_none());
        assert_eq!(
            msg.payload(SignalKind::Offer).unwrap(),
            SignalPayload::Encrypted { envelope: envelope() }
        );
    }

    #[test]
    fn seal_clear_uses_legacy_field() {
        let body = SignalBody::Answer(SessionDescription::answer("v=0"));
        let msg = SignalMessage::seal("c1", "a", "b", &body, SealedPayload::Clear(String::new()))
            .unwrap();
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["encrypted"], false);
        assert_eq!(wire["answer"]["type"], "answer");
        assert!(wire.get("encryptedData").is_none());
        assert_eq!(msg.payload(SignalKind::Answer).unwrap(), SignalPayload::Clear { body });
    }

    #[test]
    fn bare_envelope_in_encrypted_data() {
        let msg = base(json!({
            "encrypted": true,
            "encryptedData": serde_json::to_value(envelope()).unwrap(),
        }));
        assert!(matches!(
            msg.payload(SignalKind::Offer).unwrap(),
            SignalPayload::Encrypted { .. }
        ));
    }

    #[test]
    fn facade_fallback_shape_in_encrypted_data() {
        let offer = json!({"type": "offer", "sdp": "v=0"}).to_string();
        let msg = base(json!({
            "encrypted": false,
            "encryptedData": {"encrypted": false, "data": offer},
        }));
        assert_eq!(
            msg.payload(SignalKind::Offer).unwrap(),
            SignalPayload::Clear {
                body: SignalBody::Offer(SessionDescription::offer("v=0"))
            }
        );
    }

    #[test]
    fn body_object_in_encrypted_data() {
        let msg = base(json!({
            "encryptedData": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
        }));
        match msg.payload(SignalKind::IceCandidate).unwrap() {
            SignalPayload::Clear { body: SignalBody::Candidate(Some(c)) } => {
                assert_eq!(c.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn legacy_stringified_offer() {
        let msg = base(json!({
            "offer": json!({"type": "offer", "sdp": "v=0"}).to_string(),
        }));
        assert!(matches!(
            msg.clear_fallback(SignalKind::Offer),
            Some(SignalBody::Offer(_))
        ));
    }

    #[test]
    fn end_of_candidates_markers() {
        let null = base(json!({"candidate": null}));
        assert_eq!(
            null.payload(SignalKind::IceCandidate).unwrap(),
            SignalPayload::Clear { body: SignalBody::Candidate(None) }
        );

        let empty = base(json!({"candidate": {"candidate": ""}}));
        assert_eq!(
            empty.payload(SignalKind::IceCandidate).unwrap(),
            SignalPayload::Clear { body: SignalBody::Candidate(None) }
        );
    }

    #[test]
    fn nothing_usable_is_malformed() {
        let msg = base(json!({"encrypted": true}));
        assert!(matches!(
            msg.payload(SignalKind::Answer),
            Err(ProtocolError::MalformedSignal(_))
        ));
    }
}
