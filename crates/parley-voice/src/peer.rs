use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::VoiceError;
use crate::media::LocalAudioTrack;

/// `RTCPeerConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A gathered local candidate; `None` once gathering completes.
    LocalCandidate(Option<IceCandidate>),
    ConnectionState(PeerConnectionState),
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn LocalAudioTrack>) -> Result<(), VoiceError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, VoiceError>;

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), VoiceError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), VoiceError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), VoiceError>;

    /// Close the connection and release its transports. Idempotent.
    fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection that reports its callbacks on `events`.
    fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, VoiceError>;
}
