//! Call session lifecycle.
//!
//! The [`CallController`] owns the single active [`CallSession`]. It reacts
//! to call events from the relay (initiated, incoming, accepted, declined,
//! ended, error), runs one signaling machine per call, and streams
//! [`CallEvent`]s to the UI.
//!
//! Timers (ring timeout, duration ticker) and the signaling update pump carry
//! the generation of the session that started them; anything that fires for
//! an older generation is ignored.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use parley_protocol::events::{
    CallAccept, CallAccepted, CallDecline, CallDeclined, CallEnd, CallEnded, CallErrorEvent,
    CallIncoming, CallInitiate, CallInitiated, JoinRoom, OutboundEvent,
};
use parley_protocol::{
    CallHistoryApi, CallHistoryRecord, InboundEvent, SignalKind, SignalTransport, TransportEvent,
};
use parley_voice::media::MediaDevices;
use parley_voice::peer::PeerConnectionFactory;
use parley_voice::{
    spawn_signaling, CallParams, FailureReason, Role, SignalUpdate, SignalingDeps,
    SignalingHandle, SignalingState,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channels::{CallEvent, EndReason};
use crate::config::CallTimeouts;
use crate::error::CallError;
use crate::state::{CallSession, CallStatus, SharedState, UserSession};

const EVENT_BUFFER: usize = 256;
const BUSY_REASON: &str = "busy";

/// External collaborators for calls.
#[derive(Clone)]
pub struct CallDeps {
    pub transport: Arc<dyn SignalTransport>,
    pub history: Arc<dyn CallHistoryApi>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

struct ActiveCall {
    generation: u64,
    session: CallSession,
    signaling: Option<SignalingHandle>,
    accept_timer: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn stop_timers(&mut self) {
        if let Some(timer) = self.accept_timer.take() {
            timer.abort();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// A call request the relay has not answered yet.
///
/// The relay answers initiate requests in order, with either `initiated` or
/// an error, so replies are matched by position.
struct PendingInitiate {
    generation: u64,
    caller_id: String,
}

struct Inner {
    state: SharedState,
    deps: CallDeps,
    timeouts: CallTimeouts,
    events: broadcast::Sender<CallEvent>,
    active: Mutex<Option<ActiveCall>>,
    generation: AtomicU64,
    initiates: Mutex<VecDeque<PendingInitiate>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

impl CallController {
    pub fn new(state: SharedState, deps: CallDeps, timeouts: CallTimeouts) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state,
                deps,
                timeouts,
                events,
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                initiates: Mutex::new(VecDeque::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the active session.
    pub fn session(&self) -> Option<CallSession> {
        self.inner.active.lock().as_ref().map(|a| a.session.clone())
    }

    pub fn status(&self) -> CallStatus {
        self.inner
            .active
            .lock()
            .as_ref()
            .map_or(CallStatus::Idle, |a| a.session.status)
    }

    /// Start handling call events from the transport.
    ///
    /// Subscribes before returning, so events sent afterwards are seen.
    pub fn spawn_listener(&self) {
        let mut events = self.inner.deps.transport.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(controller) = Self::from_weak(&weak) else {
                            break;
                        };
                        controller.on_transport_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "call event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("call event listener stopped");
        });
        if let Some(previous) = self.inner.listener.lock().replace(task) {
            previous.abort();
        }
    }

    // ── Outgoing ──

    /// Place a call. Self-calls and calls while another session is active
    /// are rejected before anything is sent.
    pub async fn initiate(
        &self,
        peer_id: &str,
        peer_name: &str,
        conversation_id: Option<String>,
    ) -> Result<(), CallError> {
        let user = self.local_user()?;
        if peer_id == user.user_id {
            tracing::warn!(user = %user.user_id, "refusing to call self");
            return Err(CallError::SelfCall);
        }

        let generation = {
            let mut active = self.inner.active.lock();
            if active.is_some() {
                return Err(CallError::Busy);
            }
            let generation = self.next_generation();
            let mut session = CallSession::new(Role::Caller, peer_id, peer_name, CallStatus::Calling);
            session.conversation_id.clone_from(&conversation_id);
            *active = Some(ActiveCall {
                generation,
                session,
                signaling: None,
                accept_timer: None,
                ticker: None,
            });
            generation
        };
        tracing::info!(peer = %peer_id, "calling");
        self.emit_status();

        if let Some(conversation_id) = &conversation_id {
            self.join_conversation(&user.user_id, conversation_id).await;
        }
        // Queued before sending; the reply can beat the send's return
        self.inner.initiates.lock().push_back(PendingInitiate {
            generation,
            caller_id: user.user_id.clone(),
        });
        let request = OutboundEvent::CallInitiate(CallInitiate {
            caller_id: user.user_id,
            receiver_id: peer_id.to_string(),
            caller_name: user.display_name,
            conversation_id,
        });
        if let Err(e) = self.inner.deps.transport.send(&request).await {
            self.inner
                .initiates
                .lock()
                .retain(|pending| pending.generation != generation);
            self.fail(generation, e.to_string()).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_initiated(&self, event: &CallInitiated) {
        let Some(request) = self.inner.initiates.lock().pop_front() else {
            tracing::debug!(call_id = %event.call_id, "initiated for no pending call");
            return;
        };
        let assigned = {
            let mut guard = self.inner.active.lock();
            match guard.as_mut() {
                Some(active)
                    if active.generation == request.generation
                        && active.session.role == Role::Caller
                        && active.session.status == CallStatus::Calling
                        && active.session.call_id.is_none() =>
                {
                    active.session.call_id = Some(event.call_id.clone());
                    true
                }
                _ => false,
            }
        };
        if assigned {
            tracing::debug!(call_id = %event.call_id, "call id assigned");
            self.emit_status();
            return;
        }

        // Hung up before the relay answered; the callee is ringing by now
        tracing::info!(call_id = %event.call_id, "ending call abandoned before it was assigned");
        self.send_quietly(OutboundEvent::CallEnd(CallEnd {
            call_id: event.call_id.clone(),
            user_id: request.caller_id,
            duration: 0,
        }))
        .await;
        self.spawn_history_refresh();
    }

    async fn on_accepted(&self, event: &CallAccepted) {
        let generation = {
            let mut guard = self.inner.active.lock();
            match guard.as_mut() {
                Some(active)
                    if active.session.role == Role::Caller
                        && active.session.status == CallStatus::Calling
                        && active.session.call_id.as_deref() == Some(event.call_id.as_str()) =>
                {
                    active.session.status = CallStatus::Connecting;
                    active.generation
                }
                _ => return,
            }
        };
        tracing::info!(call_id = %event.call_id, "call accepted");
        self.emit_status();

        if let Err(e) = self.start_signaling(generation, Role::Caller) {
            self.abandon(generation, e.to_string()).await;
        }
    }

    // ── Incoming ──

    async fn on_incoming(&self, event: CallIncoming) {
        let user = match self.local_user() {
            Ok(user) => user,
            Err(_) => {
                tracing::warn!(call_id = %event.call_id, "incoming call while logged out");
                return;
            }
        };

        let generation = {
            let mut active = self.inner.active.lock();
            if active.is_some() {
                None
            } else {
                let generation = self.next_generation();
                let mut session = CallSession::new(
                    Role::Callee,
                    &event.caller_id,
                    &event.caller_name,
                    CallStatus::Ringing,
                );
                session.call_id = Some(event.call_id.clone());
                session.conversation_id.clone_from(&event.conversation_id);
                *active = Some(ActiveCall {
                    generation,
                    session,
                    signaling: None,
                    accept_timer: None,
                    ticker: None,
                });
                Some(generation)
            }
        };

        let Some(generation) = generation else {
            tracing::info!(call_id = %event.call_id, caller = %event.caller_id, "busy, declining incoming call");
            let decline = OutboundEvent::CallDecline(CallDecline {
                call_id: event.call_id.clone(),
                receiver_id: user.user_id,
                is_timeout: None,
                reason: Some(BUSY_REASON.into()),
            });
            if let Err(e) = self.inner.deps.transport.send(&decline).await {
                tracing::warn!(call_id = %event.call_id, error = %e, "busy decline not sent");
            }
            self.emit(CallEvent::BusyDeclined {
                call_id: event.call_id,
                caller_id: event.caller_id,
            });
            return;
        };

        tracing::info!(call_id = %event.call_id, caller = %event.caller_id, "incoming call");
        self.emit(CallEvent::IncomingCall {
            call_id: event.call_id.clone(),
            caller_id: event.caller_id.clone(),
            caller_name: event.caller_name.clone(),
        });
        self.emit_status();

        // The machine subscribes now so an early offer is held, not lost
        if let Err(e) = self.start_signaling(generation, Role::Callee) {
            self.abandon(generation, e.to_string()).await;
            return;
        }
        self.arm_accept_timer(generation);
    }

    fn arm_accept_timer(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let after = self.inner.timeouts.accept_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(controller) = Self::from_weak(&weak) {
                controller.on_accept_timeout(generation).await;
            }
        });

        let mut guard = self.inner.active.lock();
        match guard.as_mut() {
            Some(active) if active.generation == generation => {
                if let Some(old) = active.accept_timer.replace(timer) {
                    old.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    async fn on_accept_timeout(&self, generation: u64) {
        let call_id = {
            let mut guard = self.inner.active.lock();
            match guard.as_mut() {
                Some(active)
                    if active.generation == generation
                        && active.session.status == CallStatus::Ringing =>
                {
                    // This task is the timer; detach instead of aborting it
                    active.accept_timer = None;
                    active.session.call_id.clone()
                }
                _ => return,
            }
        };
        tracing::info!(call_id = ?call_id, "incoming call not answered, declining as missed");

        if let (Some(call_id), Ok(user)) = (call_id, self.local_user()) {
            self.send_quietly(OutboundEvent::CallDecline(CallDecline {
                call_id,
                receiver_id: user.user_id,
                is_timeout: Some(true),
                reason: None,
            }))
            .await;
        }
        self.teardown(generation, EndReason::Missed).await;
        self.spawn_history_refresh();
    }

    /// Answer the ringing call.
    pub async fn accept(&self) -> Result<(), CallError> {
        let user = self.local_user()?;
        let (generation, call_id, conversation_id, answered) = {
            let mut guard = self.inner.active.lock();
            let active = guard
                .as_mut()
                .filter(|a| a.session.role == Role::Callee && a.session.status == CallStatus::Ringing)
                .ok_or(CallError::NoIncomingCall)?;
            let call_id = active.session.call_id.clone().ok_or(CallError::NoIncomingCall)?;
            let answered = active
                .signaling
                .as_ref()
                .map_or(Ok(()), SignalingHandle::answer_call);
            if answered.is_ok() {
                if let Some(timer) = active.accept_timer.take() {
                    timer.abort();
                }
                active.session.status = CallStatus::Connecting;
            }
            (
                active.generation,
                call_id,
                active.session.conversation_id.clone(),
                answered,
            )
        };
        if let Err(e) = answered {
            tracing::warn!(call_id = %call_id, error = %e, "could not answer call");
            self.fail(generation, e.to_string()).await;
            self.spawn_history_refresh();
            return Err(e.into());
        }
        tracing::info!(call_id = %call_id, "accepting call");
        self.emit_status();

        if let Some(conversation_id) = &conversation_id {
            self.join_conversation(&user.user_id, conversation_id).await;
        }
        let accept = OutboundEvent::CallAccept(CallAccept {
            call_id,
            receiver_id: user.user_id,
        });
        if let Err(e) = self.inner.deps.transport.send(&accept).await {
            self.fail(generation, e.to_string()).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Reject the ringing call.
    pub async fn decline(&self) -> Result<(), CallError> {
        let user = self.local_user()?;
        let (generation, call_id) = {
            let guard = self.inner.active.lock();
            let active = guard
                .as_ref()
                .filter(|a| a.session.role == Role::Callee && a.session.status == CallStatus::Ringing)
                .ok_or(CallError::NoIncomingCall)?;
            (active.generation, active.session.call_id.clone())
        };

        if let Some(call_id) = call_id {
            self.send_quietly(OutboundEvent::CallDecline(CallDecline {
                call_id,
                receiver_id: user.user_id,
                is_timeout: None,
                reason: None,
            }))
            .await;
        }
        self.teardown(generation, EndReason::Declined).await;
        self.spawn_history_refresh();
        Ok(())
    }

    // ── In call ──

    /// Hang up. A ringing incoming call is declined instead.
    pub async fn end(&self) -> Result<(), CallError> {
        let user = self.local_user()?;
        let (generation, role, status, call_id, duration) = {
            let guard = self.inner.active.lock();
            let active = guard.as_ref().ok_or(CallError::NoActiveCall)?;
            let session = &active.session;
            (
                active.generation,
                session.role,
                session.status,
                session.call_id.clone(),
                session.elapsed_secs(),
            )
        };
        if role == Role::Callee && status == CallStatus::Ringing {
            return self.decline().await;
        }

        if let Some(call_id) = call_id {
            self.send_quietly(OutboundEvent::CallEnd(CallEnd {
                call_id,
                user_id: user.user_id,
                duration,
            }))
            .await;
        }
        self.teardown(generation, EndReason::Hangup).await;
        self.spawn_history_refresh();
        Ok(())
    }

    /// End the active call, if any. Used on logout.
    pub async fn end_active(&self) {
        if self.inner.active.lock().is_none() {
            return;
        }
        if let Err(e) = self.end().await {
            tracing::warn!(error = %e, "could not end active call cleanly");
            if let Some(generation) = self.current_generation() {
                self.teardown(generation, EndReason::Hangup).await;
            }
        }
    }

    /// End the active call and stop listening to the transport.
    pub async fn shutdown(&self) {
        self.end_active().await;
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
    }

    /// Returns the new mute state.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let muted = {
            let mut guard = self.inner.active.lock();
            let active = guard.as_mut().ok_or(CallError::NoActiveCall)?;
            active.session.is_muted = !active.session.is_muted;
            if let Some(signaling) = &active.signaling {
                signaling.set_muted(active.session.is_muted)?;
            }
            active.session.is_muted
        };
        self.emit(CallEvent::MuteChanged { muted });
        Ok(muted)
    }

    /// Returns the new speaker state. Local only; nothing is signaled.
    pub fn toggle_speaker(&self) -> Result<bool, CallError> {
        let speaker_on = {
            let mut guard = self.inner.active.lock();
            let active = guard.as_mut().ok_or(CallError::NoActiveCall)?;
            active.session.is_speaker_on = !active.session.is_speaker_on;
            active.session.is_speaker_on
        };
        self.emit(CallEvent::SpeakerChanged { speaker_on });
        Ok(speaker_on)
    }

    // ── Remote outcomes ──

    async fn on_declined(&self, event: &CallDeclined) {
        let Some(generation) = self.generation_for(&event.call_id) else {
            return;
        };
        let reason = if event.is_missed() {
            EndReason::Missed
        } else {
            EndReason::Declined
        };
        tracing::info!(call_id = %event.call_id, ?reason, "call declined by peer");
        self.teardown(generation, reason).await;
        self.spawn_history_refresh();
    }

    async fn on_ended(&self, event: &CallEnded) {
        let Some(generation) = self.generation_for(&event.call_id) else {
            return;
        };
        tracing::info!(call_id = %event.call_id, "call ended by peer");
        self.teardown(generation, EndReason::RemoteHangup).await;
        self.spawn_history_refresh();
    }

    async fn on_call_error(&self, event: CallErrorEvent) {
        tracing::warn!(message = %event.message, "relay reported a call error");
        let pending = self.inner.initiates.lock().pop_front();
        let generation = match pending {
            Some(request) if self.current_generation() != Some(request.generation) => {
                tracing::debug!("error was for an abandoned call request");
                return;
            }
            Some(request) => request.generation,
            None => match self.current_generation() {
                Some(generation) => generation,
                None => return,
            },
        };
        self.fail(generation, event.message).await;
        self.spawn_history_refresh();
    }

    // ── Signaling ──

    fn start_signaling(&self, generation: u64, role: Role) -> Result<(), CallError> {
        let user = self.local_user()?;
        let crypto = self
            .inner
            .state
            .crypto
            .read()
            .clone()
            .ok_or(CallError::NotLoggedIn)?;
        let (call_id, peer_id, muted) = {
            let guard = self.inner.active.lock();
            let active = guard
                .as_ref()
                .filter(|a| a.generation == generation)
                .ok_or(CallError::NoActiveCall)?;
            let call_id = active.session.call_id.clone().ok_or(CallError::NoActiveCall)?;
            (call_id, active.session.peer_id.clone(), active.session.is_muted)
        };

        let params = CallParams {
            call_id,
            role,
            local_id: user.user_id,
            peer_id,
        };
        let deps = SignalingDeps {
            transport: self.inner.deps.transport.clone(),
            crypto,
            media: self.inner.deps.media.clone(),
            peers: self.inner.deps.peers.clone(),
        };
        let (handle, updates) =
            spawn_signaling(params, deps, self.inner.timeouts.signaling_config());
        if muted {
            handle.set_muted(true)?;
        }
        if role == Role::Caller {
            handle.start_call()?;
        }
        tokio::spawn(pump_updates(Arc::downgrade(&self.inner), generation, updates));

        let mut guard = self.inner.active.lock();
        match guard.as_mut() {
            Some(active) if active.generation == generation => {
                active.signaling = Some(handle);
                Ok(())
            }
            // Session went away meanwhile; dropping the handle hangs up
            _ => Err(CallError::NoActiveCall),
        }
    }

    async fn on_signal_update(&self, generation: u64, update: SignalUpdate) {
        match update {
            SignalUpdate::State(SignalingState::Connected) => self.on_connected(generation),
            SignalUpdate::State(state) => {
                tracing::debug!(?state, "signaling progressed");
            }
            SignalUpdate::Encryption { encrypted } => {
                let changed = {
                    let mut guard = self.inner.active.lock();
                    match guard.as_mut() {
                        Some(active) if active.generation == generation => {
                            active.session.is_encrypted = encrypted;
                            true
                        }
                        _ => false,
                    }
                };
                if changed {
                    self.emit(CallEvent::EncryptionChanged { encrypted });
                }
            }
            SignalUpdate::Warning(message) => {
                if self.current_generation() == Some(generation) {
                    self.emit(CallEvent::Warning { message });
                }
            }
            SignalUpdate::Failed(reason) => self.on_signaling_failed(generation, &reason).await,
        }
    }

    fn on_connected(&self, generation: u64) {
        {
            let mut guard = self.inner.active.lock();
            let Some(active) = guard.as_mut().filter(|a| a.generation == generation) else {
                return;
            };
            // ICE restarts reconnect without resetting the call clock
            if active.session.status == CallStatus::Connected {
                return;
            }
            active.session.status = CallStatus::Connected;
            active.session.connected_at = Some(Instant::now());
            active.ticker = Some(self.spawn_ticker(generation));
        }
        tracing::info!("call connected");
        self.emit_status();
    }

    fn spawn_ticker(&self, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(controller) = Self::from_weak(&weak) else {
                    break;
                };
                if !controller.tick_duration(generation) {
                    break;
                }
            }
        })
    }

    fn tick_duration(&self, generation: u64) -> bool {
        let seconds = {
            let mut guard = self.inner.active.lock();
            let Some(active) = guard.as_mut().filter(|a| a.generation == generation) else {
                return false;
            };
            active.session.duration_secs = active.session.elapsed_secs();
            active.session.duration_secs
        };
        self.emit(CallEvent::DurationTick { seconds });
        true
    }

    async fn on_signaling_failed(&self, generation: u64, reason: &FailureReason) {
        tracing::warn!(%reason, "call signaling failed");
        self.fail(generation, reason.to_string()).await;
        self.spawn_history_refresh();
    }

    /// Tell the peer the call is over, then tear down with a failure.
    async fn fail(&self, generation: u64, reason: String) {
        let snapshot = {
            let guard = self.inner.active.lock();
            guard
                .as_ref()
                .filter(|a| a.generation == generation)
                .map(|a| (a.session.call_id.clone(), a.session.elapsed_secs()))
        };
        let Some((call_id, duration)) = snapshot else {
            return;
        };
        if let (Some(call_id), Ok(user)) = (call_id.clone(), self.local_user()) {
            self.send_quietly(OutboundEvent::CallEnd(CallEnd {
                call_id,
                user_id: user.user_id,
                duration,
            }))
            .await;
        }
        self.emit(CallEvent::CallFailed { call_id, reason });
        self.teardown(generation, EndReason::Failed).await;
    }

    /// Give up on a session whose signaling could not be started.
    async fn abandon(&self, generation: u64, reason: String) {
        tracing::warn!(%reason, "could not start call signaling");
        self.fail(generation, reason).await;
    }

    // ── Teardown ──

    /// Release everything owned by session `generation` and return to idle.
    async fn teardown(&self, generation: u64, reason: EndReason) {
        let taken = {
            let mut guard = self.inner.active.lock();
            if guard.as_ref().is_some_and(|a| a.generation == generation) {
                guard.take()
            } else {
                None
            }
        };
        let Some(mut call) = taken else {
            return;
        };
        call.stop_timers();
        if let Some(signaling) = call.signaling.take() {
            signaling.close().await;
        }

        call.session.status = CallStatus::Ended;
        tracing::info!(call_id = ?call.session.call_id, ?reason, "call ended");
        self.emit(CallEvent::StatusChanged {
            call_id: call.session.call_id.clone(),
            peer_id: call.session.peer_id.clone(),
            status: CallStatus::Ended,
        });
        self.emit(CallEvent::CallEnded {
            call_id: call.session.call_id,
            reason,
        });
    }

    // ── History ──

    /// Fetch the first page of call history into shared state.
    pub async fn refresh_history(&self) -> Result<Vec<CallHistoryRecord>, CallError> {
        let records = self
            .inner
            .deps
            .history
            .fetch_history(self.inner.timeouts.history_page_size, 0)
            .await?;
        self.inner.state.history.write().clone_from(&records);
        self.emit(CallEvent::HistoryUpdated {
            count: records.len(),
        });
        Ok(records)
    }

    fn spawn_history_refresh(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.refresh_history().await {
                tracing::warn!(error = %e, "call history refresh failed");
            }
        });
    }

    pub async fn delete_history_entry(&self, call_id: &str) -> Result<(), CallError> {
        self.inner.deps.history.delete_call(call_id).await?;
        let count = {
            let mut history = self.inner.state.history.write();
            history.retain(|r| r.id != call_id);
            history.len()
        };
        tracing::debug!(call_id = %call_id, "history entry deleted");
        self.emit(CallEvent::HistoryUpdated { count });
        Ok(())
    }

    // ── Plumbing ──

    async fn on_transport_event(&self, event: TransportEvent) {
        // Offers, answers and candidates belong to the signaling machine
        if SignalKind::from_event_name(&event.name).is_some() {
            return;
        }
        let parsed = match InboundEvent::parse(&event.name, event.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(event = %event.name, error = %e, "event ignored");
                return;
            }
        };
        match parsed {
            InboundEvent::CallInitiated(e) => self.on_initiated(&e).await,
            InboundEvent::CallIncoming(e) => self.on_incoming(e).await,
            InboundEvent::CallAccepted(e) => self.on_accepted(&e).await,
            InboundEvent::CallDeclined(e) => self.on_declined(&e).await,
            InboundEvent::CallEnded(e) => self.on_ended(&e).await,
            InboundEvent::CallError(e) => self.on_call_error(e).await,
            InboundEvent::UserStatusChanged(e) => {
                tracing::debug!(user = %e.user_id, online = e.is_online, "presence changed");
            }
            InboundEvent::Offer(_) | InboundEvent::Answer(_) | InboundEvent::IceCandidate(_) => {}
        }
    }

    fn local_user(&self) -> Result<UserSession, CallError> {
        self.inner
            .state
            .user
            .read()
            .clone()
            .ok_or(CallError::NotLoggedIn)
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_generation(&self) -> Option<u64> {
        self.inner.active.lock().as_ref().map(|a| a.generation)
    }

    fn generation_for(&self, call_id: &str) -> Option<u64> {
        self.inner
            .active
            .lock()
            .as_ref()
            .filter(|a| a.session.call_id.as_deref() == Some(call_id))
            .map(|a| a.generation)
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn emit_status(&self) {
        let snapshot = self.session();
        if let Some(session) = snapshot {
            self.emit(CallEvent::StatusChanged {
                call_id: session.call_id,
                peer_id: session.peer_id,
                status: session.status,
            });
        }
    }

    /// Join the conversation's relay room for the duration of the call.
    async fn join_conversation(&self, user_id: &str, conversation_id: &str) {
        self.send_quietly(OutboundEvent::Join(JoinRoom {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
        }))
        .await;
    }

    async fn send_quietly(&self, event: OutboundEvent) {
        if let Err(e) = self.inner.deps.transport.send(&event).await {
            tracing::warn!(event = event.name(), error = %e, "call event not sent");
        }
    }
}

async fn pump_updates(
    inner: Weak<Inner>,
    generation: u64,
    mut updates: mpsc::UnboundedReceiver<SignalUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let Some(controller) = CallController::from_weak(&inner) else {
            break;
        };
        controller.on_signal_update(generation, update).await;
    }
}
