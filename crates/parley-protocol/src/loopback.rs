//! In-process relay that routes call events between connected clients.
//!
//! Mirrors what the realtime backend does for voice calls: it assigns call
//! ids, forwards signaling to the addressed peer, classifies declines as
//! missed or declined, and (when a [`MemoryBackend`] is attached) writes call
//! history. Used by tests and the headless demo.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::api::{CallHistoryRecord, CallHistoryStatus};
use crate::error::ProtocolError;
use crate::events::{event, CallAccept, CallDecline, CallEnd, CallInitiate, UserOnline};
use crate::memory_backend::MemoryBackend;
use crate::transport::{SignalTransport, TransportEvent};

const CLIENT_BUFFER: usize = 256;

struct ActiveCall {
    caller: String,
    callee: String,
}

impl ActiveCall {
    fn other(&self, user: &str) -> &str {
        if user == self.caller {
            &self.callee
        } else {
            &self.caller
        }
    }
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<String, broadcast::Sender<TransportEvent>>,
    calls: HashMap<String, ActiveCall>,
    next_call: u64,
    /// Every event a client emitted, in order: (sender, event).
    emitted: Vec<(String, TransportEvent)>,
    /// Event names that are logged but never delivered.
    blocked: HashSet<String>,
    history: Option<MemoryBackend>,
}

impl HubInner {
    fn deliver(&self, user: &str, name: &str, payload: Value) {
        match self.clients.get(user) {
            Some(tx) => {
                // No live receivers is fine: the client may not be listening yet
                let _ = tx.send(TransportEvent::new(name, payload));
            }
            None => tracing::debug!(user = %user, event = name, "dropping event for offline user"),
        }
    }

    fn record(&self, call_id: &str, call: &ActiveCall, status: CallHistoryStatus, duration: u64) {
        if let Some(history) = &self.history {
            history.record_call(CallHistoryRecord {
                id: call_id.to_string(),
                caller_id: call.caller.clone(),
                receiver_id: call.callee.clone(),
                status,
                duration,
                started_at: None,
            });
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write call history into `backend` as calls finish.
    pub fn with_history(backend: MemoryBackend) -> Self {
        let hub = Self::new();
        hub.inner.lock().history = Some(backend);
        hub
    }

    /// Connect a client. Reconnecting replaces the previous channel.
    pub fn connect(&self, user_id: &str) -> LoopbackTransport {
        let (tx, _) = broadcast::channel(CLIENT_BUFFER);
        self.inner.lock().clients.insert(user_id.to_string(), tx);
        LoopbackTransport {
            hub: self.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn disconnect(&self, user_id: &str) {
        self.inner.lock().clients.remove(user_id);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().clients.contains_key(user_id)
    }

    /// Log events with this name but stop delivering them.
    pub fn block(&self, name: &str) {
        self.inner.lock().blocked.insert(name.to_string());
    }

    pub fn unblock(&self, name: &str) {
        self.inner.lock().blocked.remove(name);
    }

    /// Push an event straight to one client, bypassing routing.
    pub fn inject(&self, user_id: &str, name: &str, payload: Value) {
        self.inner.lock().deliver(user_id, name, payload);
    }

    /// Everything emitted so far as `(sender, event)`.
    pub fn emitted(&self) -> Vec<(String, TransportEvent)> {
        self.inner.lock().emitted.clone()
    }

    /// Payloads of every emitted event with `name`.
    pub fn emitted_named(&self, name: &str) -> Vec<Value> {
        self.inner
            .lock()
            .emitted
            .iter()
            .filter(|(_, e)| e.name == name)
            .map(|(_, e)| e.payload.clone())
            .collect()
    }

    pub fn active_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }

    fn route(&self, from: &str, name: &str, payload: Value) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        inner
            .emitted
            .push((from.to_string(), TransportEvent::new(name, payload.clone())));
        if inner.blocked.contains(name) {
            tracing::debug!(from = %from, event = name, "event blocked");
            return Ok(());
        }

        let de = |e: serde_json::Error| ProtocolError::Deserialization(format!("{name}: {e}"));

        match name {
            event::JOIN => {}
            event::USER_ONLINE => {
                let online: UserOnline = serde_json::from_value(payload).map_err(de)?;
                let others: Vec<String> = inner
                    .clients
                    .keys()
                    .filter(|u| **u != online.user_id)
                    .cloned()
                    .collect();
                for user in others {
                    inner.deliver(
                        &user,
                        event::USER_STATUS_CHANGED,
                        json!({"userId": online.user_id, "isOnline": true}),
                    );
                }
            }
            event::CALL_INITIATE => {
                let req: CallInitiate = serde_json::from_value(payload).map_err(de)?;
                if !inner.clients.contains_key(&req.receiver_id) {
                    inner.deliver(from, event::CALL_ERROR, json!({"message": "User is offline"}));
                    return Ok(());
                }
                inner.next_call += 1;
                let call_id = format!("call-{}", inner.next_call);
                inner.calls.insert(
                    call_id.clone(),
                    ActiveCall {
                        caller: req.caller_id.clone(),
                        callee: req.receiver_id.clone(),
                    },
                );
                tracing::debug!(call_id = %call_id, caller = %req.caller_id, "call routed");
                inner.deliver(from, event::CALL_INITIATED, json!({"callId": call_id}));
                inner.deliver(
                    &req.receiver_id,
                    event::CALL_INCOMING,
                    json!({
                        "callId": call_id,
                        "callerId": req.caller_id,
                        "callerName": req.caller_name,
                        "conversationId": req.conversation_id,
                    }),
                );
            }
            event::CALL_ACCEPT => {
                let req: CallAccept = serde_json::from_value(payload).map_err(de)?;
                if let Some(call) = inner.calls.get(&req.call_id) {
                    let other = call.other(from).to_string();
                    inner.deliver(&other, event::CALL_ACCEPTED, json!({"callId": req.call_id}));
                }
            }
            event::CALL_DECLINE => {
                let req: CallDecline = serde_json::from_value(payload).map_err(de)?;
                if let Some(call) = inner.calls.remove(&req.call_id) {
                    let missed = req.is_timeout == Some(true);
                    let status = if missed {
                        CallHistoryStatus::Missed
                    } else {
                        CallHistoryStatus::Declined
                    };
                    inner.record(&req.call_id, &call, status, 0);
                    inner.deliver(
                        call.other(from),
                        event::CALL_DECLINED,
                        json!({
                            "callId": req.call_id,
                            "isTimeout": missed,
                            "status": if missed { "missed" } else { "declined" },
                        }),
                    );
                }
            }
            event::CALL_END => {
                let req: CallEnd = serde_json::from_value(payload).map_err(de)?;
                if let Some(call) = inner.calls.remove(&req.call_id) {
                    let status = if req.duration > 0 {
                        CallHistoryStatus::Completed
                    } else {
                        CallHistoryStatus::Failed
                    };
                    inner.record(&req.call_id, &call, status, req.duration);
                    inner.deliver(call.other(from), event::CALL_ENDED, json!({"callId": req.call_id}));
                }
            }
            event::CALL_OFFER | event::CALL_ANSWER | event::CALL_ICE_CANDIDATE => {
                let to = payload
                    .get("to")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::MalformedSignal(format!("{name} without `to`")))?
                    .to_string();
                inner.deliver(&to, name, payload);
            }
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        }
        Ok(())
    }
}

/// One client's connection to a [`LoopbackHub`].
#[derive(Clone)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    user_id: String,
}

impl LoopbackTransport {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl SignalTransport for LoopbackTransport {
    async fn emit(&self, name: &str, payload: Value) -> Result<(), ProtocolError> {
        self.hub.route(&self.user_id, name, payload)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        let inner = self.hub.inner.lock();
        match inner.clients.get(&self.user_id) {
            Some(tx) => tx.subscribe(),
            // Disconnected: a receiver whose sender is already gone
            None => broadcast::channel(1).1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InboundEvent, OutboundEvent};

    async fn next(rx: &mut broadcast::Receiver<TransportEvent>) -> InboundEvent {
        let ev = rx.recv().await.unwrap();
        InboundEvent::parse(&ev.name, ev.payload).unwrap()
    }

    fn initiate(caller: &str, receiver: &str) -> OutboundEvent {
        OutboundEvent::CallInitiate(CallInitiate {
            caller_id: caller.into(),
            receiver_id: receiver.into(),
            caller_name: caller.to_uppercase(),
            conversation_id: None,
        })
    }

    #[tokio::test]
    async fn initiate_assigns_id_and_rings_callee() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        let mut alice_rx = alice.subscribe();
        let mut bob_rx = bob.subscribe();

        alice.send(&initiate("alice", "bob")).await.unwrap();

        match next(&mut alice_rx).await {
            InboundEvent::CallInitiated(e) => assert_eq!(e.call_id, "call-1"),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut bob_rx).await {
            InboundEvent::CallIncoming(e) => {
                assert_eq!(e.call_id, "call-1");
                assert_eq!(e.caller_name, "ALICE");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hub.active_calls(), 1);
    }

    #[tokio::test]
    async fn offline_callee_gets_error() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let mut rx = alice.subscribe();

        alice.send(&initiate("alice", "bob")).await.unwrap();
        assert!(matches!(next(&mut rx).await, InboundEvent::CallError(_)));
        assert_eq!(hub.active_calls(), 0);
    }

    #[tokio::test]
    async fn timeout_decline_is_recorded_as_missed() {
        let backend = MemoryBackend::new();
        let hub = LoopbackHub::with_history(backend.clone());
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        let mut alice_rx = alice.subscribe();

        alice.send(&initiate("alice", "bob")).await.unwrap();
        let _ = next(&mut alice_rx).await;
        bob.send(&OutboundEvent::CallDecline(CallDecline {
            call_id: "call-1".into(),
            receiver_id: "bob".into(),
            is_timeout: Some(true),
            reason: None,
        }))
        .await
        .unwrap();

        match next(&mut alice_rx).await {
            InboundEvent::CallDeclined(e) => assert!(e.is_missed()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.history()[0].status, CallHistoryStatus::Missed);
    }

    #[tokio::test]
    async fn blocked_events_are_logged_not_delivered() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        let mut bob_rx = bob.subscribe();
        hub.block(event::CALL_OFFER);

        let offer = json!({"callId": "c", "from": "alice", "to": "bob", "encrypted": false});
        alice.emit(event::CALL_OFFER, offer.clone()).await.unwrap();
        alice.emit(event::CALL_ANSWER, offer.clone()).await.unwrap();

        assert_eq!(hub.emitted_named(event::CALL_OFFER).len(), 1);
        assert_eq!(bob_rx.recv().await.unwrap().name, event::CALL_ANSWER);

        hub.unblock(event::CALL_OFFER);
        alice.emit(event::CALL_OFFER, offer).await.unwrap();
        assert_eq!(bob_rx.recv().await.unwrap().name, event::CALL_OFFER);
        assert_eq!(hub.emitted_named(event::CALL_OFFER).len(), 2);
    }

    #[tokio::test]
    async fn disconnected_callee_is_offline() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let _bob = hub.connect("bob");
        let mut rx = alice.subscribe();
        assert!(hub.is_online("bob"));

        hub.disconnect("bob");
        assert!(!hub.is_online("bob"));

        alice.send(&initiate("alice", "bob")).await.unwrap();
        match next(&mut rx).await {
            InboundEvent::CallError(e) => assert_eq!(e.message, "User is offline"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hub.active_calls(), 0);
    }

    #[tokio::test]
    async fn join_is_recorded_but_not_routed() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let mut rx = alice.subscribe();

        alice
            .send(&OutboundEvent::Join(crate::events::JoinRoom {
                conversation_id: "conv-1".into(),
                user_id: "alice".into(),
            }))
            .await
            .unwrap();

        let joins = hub.emitted_named(event::JOIN);
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0]["conversationId"], "conv-1");
        assert!(rx.try_recv().is_err());
    }
}
