use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MediaError;

/// The local outbound microphone track.
pub trait LocalAudioTrack: Send + Sync {
    /// Enable or disable sending audio. Does not renegotiate.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Release the capture device. Must be safe to call more than once.
    fn stop(&self);
}

/// Access to capture devices (`getUserMedia` for audio).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_audio(&self) -> Result<Arc<dyn LocalAudioTrack>, MediaError>;
}
