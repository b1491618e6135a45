use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ProtocolError;
use crate::events::OutboundEvent;

/// A named event with its JSON payload, as carried by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub name: String,
    pub payload: Value,
}

impl TransportEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Bidirectional event channel to the realtime relay.
///
/// The relay addresses clients by user id; framing and reconnection are the
/// implementation's concern.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Emit a named event.
    async fn emit(&self, name: &str, payload: Value) -> Result<(), ProtocolError>;

    /// Subscribe to every inbound event for this client.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Serialize and emit a typed event.
    async fn send(&self, event: &OutboundEvent) -> Result<(), ProtocolError> {
        let payload = event.to_payload()?;
        tracing::debug!(event = event.name(), "emit");
        self.emit(event.name(), payload).await
    }
}
