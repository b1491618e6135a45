pub mod api;
pub mod crypto_context;
pub mod directory;
pub mod error;
pub mod events;
pub mod loopback;
pub mod memory_backend;
pub mod signaling;
pub mod transport;

pub use api::{CallHistoryApi, CallHistoryRecord, CallHistoryStatus, HttpBackend, KeyDirectory};
pub use crypto_context::MessageCrypto;
pub use directory::PeerKeyCache;
pub use error::ProtocolError;
pub use events::{InboundEvent, OutboundEvent};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use memory_backend::{MemoryBackend, MemoryBackendSession};
pub use signaling::{
    IceCandidate, SdpType, SessionDescription, SignalBody, SignalKind, SignalMessage,
    SignalPayload,
};
pub use transport::{SignalTransport, TransportEvent};
