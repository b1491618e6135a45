pub mod candidates;
pub mod error;
pub mod loopback;
pub mod machine;
pub mod media;
pub mod peer;
pub mod retry;
pub mod state;

pub use error::{FailureReason, MediaError, VoiceError};
pub use machine::{
    spawn_signaling, CallParams, SignalInput, SignalUpdate, SignalingDeps, SignalingHandle,
    SignalingMachine,
};
pub use state::{Role, SignalingState};

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Timeouts and retry budget for call negotiation.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Caller gives up when no answer arrives within this window.
    pub answer_timeout: Duration,
    /// Window for ICE to connect after the answer, per attempt.
    pub connect_timeout: Duration,
    pub max_ice_restarts: u32,
    /// Applied to transport emits and remote description application.
    pub retry: RetryPolicy,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            max_ice_restarts: 2,
            retry: RetryPolicy::default(),
        }
    }
}
