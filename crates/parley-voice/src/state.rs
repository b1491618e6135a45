//! Negotiation states for one call attempt.

use serde::Serialize;

use crate::error::VoiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalingState {
    #[default]
    Idle,
    GettingMedia,
    MediaReady,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Failed,
    Ended,
}

impl SignalingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Ended)
    }

    /// Whether a local description has been exchanged and ICE may be running.
    pub fn is_negotiated(self) -> bool {
        matches!(
            self,
            Self::AnswerReceived | Self::AnswerSent | Self::Connected
        )
    }

    pub fn can_transition(self, to: Self) -> bool {
        use SignalingState::{
            AnswerReceived, AnswerSent, Connected, Ended, Failed, GettingMedia, Idle, MediaReady,
            OfferReceived, OfferSent,
        };
        match (self, to) {
            (Idle, GettingMedia)
            | (GettingMedia, MediaReady)
            | (MediaReady, OfferSent | OfferReceived)
            | (OfferReceived, AnswerSent)
            | (OfferSent, AnswerReceived)
            | (AnswerReceived | AnswerSent, Connected)
            // ICE restart: the caller re-offers, the callee re-answers
            | (AnswerReceived | Connected, OfferSent)
            | (AnswerSent | Connected, AnswerSent) => true,
            (from, Failed | Ended) => !from.is_terminal(),
            _ => false,
        }
    }

    /// The state after moving to `to`, or `InvalidTransition`.
    pub fn transition(self, to: Self) -> Result<Self, VoiceError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(VoiceError::InvalidTransition { from: self, to })
        }
    }
}
