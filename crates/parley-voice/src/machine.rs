//! Offer/answer/ICE negotiation for one call attempt.
//!
//! A [`SignalingMachine`] owns the microphone track, the peer connection and
//! the negotiation timers for a single call. Every input (API call, remote
//! signal, media result, peer-connection callback, timer expiry) is handled
//! one at a time by [`SignalingMachine::handle`]; [`spawn_signaling`] runs
//! that loop on a task and hands back a [`SignalingHandle`].
//!
//! Outbound offers, answers and candidates are sealed for the peer through
//! [`MessageCrypto::seal_for_peer`]. When that yields clear text the message
//! is still sent, marked `encrypted: false`, and a
//! [`SignalUpdate::Encryption`] tells the UI the call is not end-to-end
//! encrypted.

use std::sync::Arc;
use std::time::Duration;

use parley_protocol::events::OutboundEvent;
use parley_protocol::{
    IceCandidate, MessageCrypto, SessionDescription, SignalBody, SignalKind, SignalMessage,
    SignalPayload, SignalTransport, TransportEvent,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::candidates::PendingCandidateQueue;
use crate::error::{FailureReason, MediaError, VoiceError};
use crate::media::{LocalAudioTrack, MediaDevices};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use crate::retry::retry;
use crate::state::{Role, SignalingState};
use crate::SignalingConfig;

/// Identity of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParams {
    pub call_id: String,
    pub role: Role,
    pub local_id: String,
    pub peer_id: String,
}

/// Collaborators a machine needs.
#[derive(Clone)]
pub struct SignalingDeps {
    pub transport: Arc<dyn SignalTransport>,
    pub crypto: Arc<MessageCrypto>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

pub enum SignalInput {
    /// Caller: acquire media and send the offer.
    StartCall,
    /// Callee: acquire media and answer once the offer is here.
    AnswerCall,
    Remote {
        kind: SignalKind,
        message: SignalMessage,
    },
    MediaAcquired(Result<Arc<dyn LocalAudioTrack>, MediaError>),
    Peer(PeerEvent),
    AnswerTimeout(u64),
    ConnectTimeout(u64),
    SetMuted(bool),
    Hangup,
}

impl SignalInput {
    fn label(&self) -> &'static str {
        match self {
            Self::StartCall => "start_call",
            Self::AnswerCall => "answer_call",
            Self::Remote { .. } => "remote_signal",
            Self::MediaAcquired(_) => "media_acquired",
            Self::Peer(_) => "peer_event",
            Self::AnswerTimeout(_) => "answer_timeout",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::SetMuted(_) => "set_muted",
            Self::Hangup => "hangup",
        }
    }
}

/// Notifications for the call controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalUpdate {
    State(SignalingState),
    /// Sent once when the call stops being end-to-end encrypted.
    Encryption { encrypted: bool },
    Warning(String),
    Failed(FailureReason),
}

/// Receiving ends created alongside a machine.
pub struct MachineChannels {
    pub inputs: mpsc::UnboundedReceiver<SignalInput>,
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    pub updates: mpsc::UnboundedReceiver<SignalUpdate>,
    pub state: watch::Receiver<SignalingState>,
}

struct Deadline {
    generation: u64,
    handle: JoinHandle<()>,
}

fn expire(slot: &mut Option<Deadline>, generation: u64) -> bool {
    if slot.as_ref().is_some_and(|d| d.generation == generation) {
        *slot = None;
        true
    } else {
        false
    }
}

fn cancel(slot: &mut Option<Deadline>) {
    if let Some(deadline) = slot.take() {
        deadline.handle.abort();
    }
}

pub struct SignalingMachine {
    params: CallParams,
    deps: SignalingDeps,
    config: SignalingConfig,

    state: SignalingState,
    state_tx: watch::Sender<SignalingState>,
    updates: mpsc::UnboundedSender<SignalUpdate>,
    inputs: mpsc::UnboundedSender<SignalInput>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,

    track: Option<Arc<dyn LocalAudioTrack>>,
    pc: Option<Arc<dyn PeerConnection>>,
    media_task: Option<JoinHandle<()>>,
    pending_candidates: PendingCandidateQueue,
    pending_offer: Option<SessionDescription>,
    remote_description_set: bool,
    should_answer: bool,
    muted: bool,
    encrypted: bool,
    ice_restarts: u32,

    answer_deadline: Option<Deadline>,
    connect_deadline: Option<Deadline>,
    timer_generation: u64,
    released: bool,
}

impl SignalingMachine {
    pub fn new(
        params: CallParams,
        deps: SignalingDeps,
        config: SignalingConfig,
    ) -> (Self, MachineChannels) {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SignalingState::Idle);

        let machine = Self {
            params,
            deps,
            config,
            state: SignalingState::Idle,
            state_tx,
            updates: updates_tx,
            inputs: inputs_tx,
            peer_events: peer_events_tx,
            track: None,
            pc: None,
            media_task: None,
            pending_candidates: PendingCandidateQueue::new(),
            pending_offer: None,
            remote_description_set: false,
            should_answer: false,
            muted: false,
            encrypted: true,
            ice_restarts: 0,
            answer_deadline: None,
            connect_deadline: None,
            timer_generation: 0,
            released: false,
        };
        let channels = MachineChannels {
            inputs,
            peer_events,
            updates,
            state,
        };
        (machine, channels)
    }

    pub fn params(&self) -> &CallParams {
        &self.params
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn input_sender(&self) -> mpsc::UnboundedSender<SignalInput> {
        self.inputs.clone()
    }

    pub fn should_answer(&self) -> bool {
        self.should_answer
    }

    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts
    }

    /// Process one input. Failures move the machine to `failed` and release
    /// its resources; they are reported through [`SignalUpdate::Failed`].
    pub async fn handle(&mut self, input: SignalInput) {
        if self.state.is_terminal() {
            if let SignalInput::MediaAcquired(Ok(track)) = input {
                track.stop();
            } else {
                tracing::debug!(
                    call_id = %self.params.call_id,
                    input = input.label(),
                    "input after call ended ignored"
                );
            }
            return;
        }

        let result = match input {
            SignalInput::StartCall => self.start_call(),
            SignalInput::AnswerCall => self.answer_call().await,
            SignalInput::Remote { kind, message } => self.on_remote(kind, message).await,
            SignalInput::MediaAcquired(result) => self.on_media(result).await,
            SignalInput::Peer(event) => self.on_peer_event(event).await,
            SignalInput::AnswerTimeout(generation) => self.on_answer_timeout(generation),
            SignalInput::ConnectTimeout(generation) => self.on_connect_timeout(generation).await,
            SignalInput::SetMuted(muted) => {
                self.set_muted(muted);
                Ok(())
            }
            SignalInput::Hangup => {
                self.end();
                Ok(())
            }
        };

        if let Err(reason) = result {
            self.fail(reason);
        }
    }

    fn set_state(&mut self, to: SignalingState) -> Result<(), FailureReason> {
        self.state = self.state.transition(to)?;
        self.publish_state();
        Ok(())
    }

    fn publish_state(&mut self) {
        tracing::info!(
            call_id = %self.params.call_id,
            role = ?self.params.role,
            state = ?self.state,
            "signaling state"
        );
        self.state_tx.send_replace(self.state);
        let _ = self.updates.send(SignalUpdate::State(self.state));
    }

    fn start_call(&mut self) -> Result<(), FailureReason> {
        if self.params.role != Role::Caller {
            tracing::warn!(call_id = %self.params.call_id, "start_call on the callee side ignored");
            return Ok(());
        }
        if self.state != SignalingState::Idle {
            return Ok(());
        }
        self.set_state(SignalingState::GettingMedia)?;
        self.acquire_media();
        Ok(())
    }

    async fn answer_call(&mut self) -> Result<(), FailureReason> {
        if self.params.role != Role::Callee {
            tracing::warn!(call_id = %self.params.call_id, "answer_call on the caller side ignored");
            return Ok(());
        }
        self.should_answer = true;
        match self.state {
            SignalingState::Idle => {
                self.set_state(SignalingState::GettingMedia)?;
                self.acquire_media();
            }
            SignalingState::MediaReady => self.answer_pending_offer().await?,
            _ => {
                tracing::debug!(call_id = %self.params.call_id, "answer intent recorded");
            }
        }
        Ok(())
    }

    fn acquire_media(&mut self) {
        let media = self.deps.media.clone();
        let inputs = self.inputs.clone();
        self.media_task = Some(tokio::spawn(async move {
            let result = media.get_user_audio().await;
            let _ = inputs.send(SignalInput::MediaAcquired(result));
        }));
    }

    async fn on_media(
        &mut self,
        result: Result<Arc<dyn LocalAudioTrack>, MediaError>,
    ) -> Result<(), FailureReason> {
        self.media_task = None;
        let track = result.map_err(FailureReason::Media)?;
        if self.state != SignalingState::GettingMedia {
            track.stop();
            return Ok(());
        }

        track.set_enabled(!self.muted);
        self.track = Some(track.clone());
        let pc = self.deps.peers.create(self.peer_events.clone())?;
        self.pc = Some(pc.clone());
        pc.add_track(track).await?;
        self.set_state(SignalingState::MediaReady)?;

        match self.params.role {
            Role::Caller => self.send_offer(false).await,
            Role::Callee if self.should_answer => self.answer_pending_offer().await,
            Role::Callee => Ok(()),
        }
    }

    fn peer_connection(&self) -> Result<Arc<dyn PeerConnection>, FailureReason> {
        self.pc
            .clone()
            .ok_or_else(|| FailureReason::Negotiation("no peer connection".into()))
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), FailureReason> {
        let pc = self.peer_connection()?;
        let offer = pc.create_offer(ice_restart).await?;
        pc.set_local_description(&offer).await?;
        self.send_signal(SignalBody::Offer(offer)).await?;
        if self.state != SignalingState::OfferSent {
            self.set_state(SignalingState::OfferSent)?;
        }
        if ice_restart {
            self.arm_connect_timer();
        } else {
            self.arm_answer_timer();
        }
        Ok(())
    }

    async fn answer_pending_offer(&mut self) -> Result<(), FailureReason> {
        match self.pending_offer.take() {
            Some(offer) => self.accept_offer(offer).await,
            None => Ok(()),
        }
    }

    /// Apply a remote offer and answer it. Also handles restart offers once
    /// the call is negotiated.
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), FailureReason> {
        let pc = self.peer_connection()?;
        self.apply_remote_description(&pc, &offer).await?;
        if self.state == SignalingState::MediaReady {
            self.set_state(SignalingState::OfferReceived)?;
        }
        self.drain_candidates(&pc).await;

        let answer = pc.create_answer().await?;
        pc.set_local_description(&answer).await?;
        self.send_signal(SignalBody::Answer(answer)).await?;
        self.set_state(SignalingState::AnswerSent)?;
        self.arm_connect_timer();
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
        desc: &SessionDescription,
    ) -> Result<(), FailureReason> {
        retry(&self.config.retry, "set remote description", |_| {
            let pc = pc.clone();
            let desc = desc.clone();
            async move { pc.set_remote_description(&desc).await }
        })
        .await?;
        self.remote_description_set = true;
        Ok(())
    }

    async fn drain_candidates(&mut self, pc: &Arc<dyn PeerConnection>) {
        let queued = self.pending_candidates.drain();
        if !queued.is_empty() {
            tracing::debug!(
                call_id = %self.params.call_id,
                count = queued.len(),
                "applying queued candidates"
            );
        }
        for candidate in queued {
            if let Err(e) = pc.add_ice_candidate(&candidate).await {
                tracing::warn!(call_id = %self.params.call_id, error = %e, "queued candidate rejected");
            }
        }
    }

    async fn send_signal(&mut self, body: SignalBody) -> Result<(), FailureReason> {
        let plaintext = body.to_plaintext()?;
        let sealed = self
            .deps
            .crypto
            .seal_for_peer(&plaintext, &self.params.peer_id)
            .await;
        let encrypted = sealed.is_encrypted();
        if !encrypted {
            self.mark_unencrypted("peer has no usable key");
        }

        let message = SignalMessage::seal(
            &self.params.call_id,
            &self.params.local_id,
            &self.params.peer_id,
            &body,
            sealed,
        )?;
        let event = match body.kind() {
            SignalKind::Offer => OutboundEvent::Offer(message),
            SignalKind::Answer => OutboundEvent::Answer(message),
            SignalKind::IceCandidate => OutboundEvent::IceCandidate(message),
        };

        let transport = self.deps.transport.clone();
        retry(&self.config.retry, event.name(), |_| {
            let transport = transport.clone();
            let event = event.clone();
            async move { transport.send(&event).await }
        })
        .await?;

        tracing::debug!(
            call_id = %self.params.call_id,
            kind = ?body.kind(),
            encrypted,
            "signal sent"
        );
        Ok(())
    }

    fn mark_unencrypted(&mut self, why: &str) {
        if self.encrypted {
            self.encrypted = false;
            tracing::warn!(call_id = %self.params.call_id, reason = why, "call is not end-to-end encrypted");
            let _ = self.updates.send(SignalUpdate::Encryption { encrypted: false });
        }
    }

    async fn on_remote(
        &mut self,
        kind: SignalKind,
        message: SignalMessage,
    ) -> Result<(), FailureReason> {
        if message.call_id != self.params.call_id || message.from != self.params.peer_id {
            tracing::debug!(
                call_id = %self.params.call_id,
                from = %message.from,
                "signal for another call ignored"
            );
            return Ok(());
        }

        let body = match self.decode(kind, &message).await {
            Ok(body) => body,
            // A lost candidate is recoverable; a lost description is not
            Err(reason) if kind == SignalKind::IceCandidate => {
                tracing::warn!(call_id = %self.params.call_id, %reason, "candidate dropped");
                let _ = self.updates.send(SignalUpdate::Warning(reason.to_string()));
                return Ok(());
            }
            Err(reason) => return Err(reason),
        };

        match body {
            SignalBody::Offer(desc) => self.on_offer(desc).await,
            SignalBody::Answer(desc) => self.on_answer(desc).await,
            SignalBody::Candidate(candidate) => {
                self.on_candidate(candidate).await;
                Ok(())
            }
        }
    }

    /// Open an inbound signal, falling back to its clear fields when the
    /// sealed body cannot be decrypted.
    async fn decode(
        &mut self,
        kind: SignalKind,
        message: &SignalMessage,
    ) -> Result<SignalBody, FailureReason> {
        let payload = message
            .payload(kind)
            .map_err(|e| FailureReason::SecureChannel(e.to_string()))?;

        let envelope = match payload {
            SignalPayload::Clear { body } => {
                self.mark_unencrypted("peer sent a clear signal");
                return Ok(body);
            }
            SignalPayload::Encrypted { envelope } => envelope,
        };

        let opened = match self
            .deps
            .crypto
            .decrypt_from_peer(&envelope, &self.params.peer_id)
            .await
        {
            Ok(plaintext) => SignalBody::from_plaintext(kind, &plaintext),
            Err(e) => Err(e),
        };

        match opened {
            Ok(body) => Ok(body),
            Err(e) => match message.clear_fallback(kind) {
                Some(body) => {
                    tracing::warn!(
                        call_id = %self.params.call_id,
                        error = %e,
                        "encrypted signal unreadable, using clear fields"
                    );
                    self.mark_unencrypted("encrypted signal unreadable");
                    Ok(body)
                }
                None => Err(FailureReason::SecureChannel(e.to_string())),
            },
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), FailureReason> {
        if self.params.role == Role::Caller {
            tracing::warn!(call_id = %self.params.call_id, "caller received an offer, ignored");
            return Ok(());
        }
        match self.state {
            SignalingState::Idle | SignalingState::GettingMedia => {
                tracing::debug!(call_id = %self.params.call_id, "offer held until media is ready");
                self.pending_offer = Some(offer);
                Ok(())
            }
            SignalingState::MediaReady if self.should_answer => self.accept_offer(offer).await,
            SignalingState::MediaReady => {
                self.pending_offer = Some(offer);
                Ok(())
            }
            SignalingState::AnswerSent | SignalingState::Connected => {
                self.ice_restarts += 1;
                tracing::info!(
                    call_id = %self.params.call_id,
                    attempt = self.ice_restarts,
                    "answering restart offer"
                );
                self.accept_offer(offer).await
            }
            other => {
                tracing::debug!(call_id = %self.params.call_id, state = ?other, "offer ignored");
                Ok(())
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), FailureReason> {
        if self.params.role == Role::Callee || self.state != SignalingState::OfferSent {
            tracing::debug!(call_id = %self.params.call_id, state = ?self.state, "answer ignored");
            return Ok(());
        }
        cancel(&mut self.answer_deadline);
        let pc = self.peer_connection()?;
        self.apply_remote_description(&pc, &answer).await?;
        self.set_state(SignalingState::AnswerReceived)?;
        self.drain_candidates(&pc).await;
        self.arm_connect_timer();
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            tracing::debug!(call_id = %self.params.call_id, "remote end of candidates");
            return;
        };
        let ready = self.pc.clone().filter(|_| self.remote_description_set);
        match ready {
            Some(pc) => {
                if let Err(e) = pc.add_ice_candidate(&candidate).await {
                    tracing::warn!(call_id = %self.params.call_id, error = %e, "candidate rejected");
                }
            }
            None => {
                self.pending_candidates.push(candidate);
                tracing::debug!(
                    call_id = %self.params.call_id,
                    queued = self.pending_candidates.len(),
                    "candidate queued until remote description"
                );
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), FailureReason> {
        match event {
            PeerEvent::LocalCandidate(Some(candidate)) => {
                self.send_signal(SignalBody::Candidate(Some(candidate))).await
            }
            PeerEvent::LocalCandidate(None) => Ok(()),
            PeerEvent::ConnectionState(PeerConnectionState::Connected) => {
                if self.state.is_negotiated() && self.state != SignalingState::Connected {
                    cancel(&mut self.connect_deadline);
                    self.set_state(SignalingState::Connected)?;
                }
                Ok(())
            }
            PeerEvent::ConnectionState(
                PeerConnectionState::Disconnected | PeerConnectionState::Failed,
            ) if self.state == SignalingState::Connected => {
                tracing::warn!(call_id = %self.params.call_id, "connectivity lost");
                match self.params.role {
                    Role::Caller => self.restart_ice().await,
                    Role::Callee => {
                        self.arm_connect_timer();
                        Ok(())
                    }
                }
            }
            PeerEvent::ConnectionState(_) => Ok(()),
        }
    }

    fn on_answer_timeout(&mut self, generation: u64) -> Result<(), FailureReason> {
        if expire(&mut self.answer_deadline, generation) && self.state == SignalingState::OfferSent
        {
            return Err(FailureReason::NoResponse);
        }
        Ok(())
    }

    async fn on_connect_timeout(&mut self, generation: u64) -> Result<(), FailureReason> {
        if !expire(&mut self.connect_deadline, generation) {
            return Ok(());
        }
        tracing::warn!(
            call_id = %self.params.call_id,
            restarts = self.ice_restarts,
            "connection not established in time"
        );
        match self.params.role {
            Role::Caller => self.restart_ice().await,
            // Only the offerer restarts ICE; the callee keeps waiting for a restart offer
            Role::Callee if self.ice_restarts < self.config.max_ice_restarts => {
                self.arm_connect_timer();
                Ok(())
            }
            Role::Callee => Err(FailureReason::ConnectionTimeout),
        }
    }

    async fn restart_ice(&mut self) -> Result<(), FailureReason> {
        if self.ice_restarts >= self.config.max_ice_restarts {
            return Err(FailureReason::ConnectionTimeout);
        }
        self.ice_restarts += 1;
        tracing::info!(
            call_id = %self.params.call_id,
            attempt = self.ice_restarts,
            "restarting ICE"
        );
        self.send_offer(true).await
    }

    fn arm(&mut self, after: Duration, make: fn(u64) -> SignalInput) -> Deadline {
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let inputs = self.inputs.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(make(generation));
        });
        Deadline { generation, handle }
    }

    fn arm_answer_timer(&mut self) {
        let deadline = self.arm(self.config.answer_timeout, SignalInput::AnswerTimeout);
        cancel(&mut self.answer_deadline);
        self.answer_deadline = Some(deadline);
    }

    fn arm_connect_timer(&mut self) {
        let deadline = self.arm(self.config.connect_timeout, SignalInput::ConnectTimeout);
        cancel(&mut self.connect_deadline);
        self.connect_deadline = Some(deadline);
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(track) = &self.track {
            track.set_enabled(!muted);
        }
        tracing::debug!(call_id = %self.params.call_id, muted, "mute changed");
    }

    fn end(&mut self) {
        self.release();
        if self.state.can_transition(SignalingState::Ended) {
            self.state = SignalingState::Ended;
            self.publish_state();
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        tracing::warn!(call_id = %self.params.call_id, %reason, "call attempt failed");
        self.release();
        if self.state.can_transition(SignalingState::Failed) {
            self.state = SignalingState::Failed;
            self.publish_state();
        }
        let _ = self.updates.send(SignalUpdate::Failed(reason));
    }

    /// Stop timers, the track and the peer connection. Safe to call from any
    /// state and more than once.
    pub fn release(&mut self) {
        cancel(&mut self.answer_deadline);
        cancel(&mut self.connect_deadline);
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        if let Some(track) = self.track.take() {
            track.stop();
        }
        if let Some(pc) = self.pc.take() {
            pc.close();
        }
        self.pending_candidates.clear();
        self.pending_offer = None;
        self.remote_description_set = false;
        if !self.released {
            self.released = true;
            tracing::debug!(call_id = %self.params.call_id, "signaling resources released");
        }
    }
}

/// Control handle for a machine running on its own task.
///
/// Dropping the handle hangs up.
pub struct SignalingHandle {
    call_id: String,
    inputs: mpsc::UnboundedSender<SignalInput>,
    state: watch::Receiver<SignalingState>,
    task: Option<JoinHandle<()>>,
}

impl SignalingHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SignalingState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&SignalingState) -> bool,
    ) -> Result<SignalingState, VoiceError> {
        let mut rx = self.state.clone();
        let state = rx.wait_for(pred).await.map_err(|_| VoiceError::Closed)?;
        Ok(*state)
    }

    fn send(&self, input: SignalInput) -> Result<(), VoiceError> {
        self.inputs.send(input).map_err(|_| VoiceError::Closed)
    }

    pub fn start_call(&self) -> Result<(), VoiceError> {
        self.send(SignalInput::StartCall)
    }

    pub fn answer_call(&self) -> Result<(), VoiceError> {
        self.send(SignalInput::AnswerCall)
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), VoiceError> {
        self.send(SignalInput::SetMuted(muted))
    }

    pub fn hangup(&self) -> Result<(), VoiceError> {
        self.send(SignalInput::Hangup)
    }

    /// Feed a remote signal that arrived outside the transport subscription.
    pub fn deliver(&self, kind: SignalKind, message: SignalMessage) -> Result<(), VoiceError> {
        self.send(SignalInput::Remote { kind, message })
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Hang up and wait for the driver to release everything.
    pub async fn close(mut self) {
        let _ = self.send(SignalInput::Hangup);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        let _ = self.inputs.send(SignalInput::Hangup);
    }
}

/// Run a machine on its own task.
///
/// The task subscribes to `deps.transport` before returning, so no signal for
/// `params.call_id` sent after this call is missed.
pub fn spawn_signaling(
    params: CallParams,
    deps: SignalingDeps,
    config: SignalingConfig,
) -> (SignalingHandle, mpsc::UnboundedReceiver<SignalUpdate>) {
    let signals = deps.transport.subscribe();
    let call_id = params.call_id.clone();
    let (mut machine, channels) = SignalingMachine::new(params, deps, config);
    let MachineChannels {
        inputs: mut inputs_rx,
        peer_events: mut peer_rx,
        updates,
        state,
    } = channels;
    let inputs = machine.input_sender();

    let task_call_id = call_id.clone();
    let task = tokio::spawn(async move {
        let mut signals = Some(signals);
        loop {
            let input = tokio::select! {
                input = inputs_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                Some(event) = peer_rx.recv() => SignalInput::Peer(event),
                input = next_signal(&mut signals, &task_call_id) => input,
            };
            machine.handle(input).await;
            if machine.state().is_terminal() {
                break;
            }
        }
        machine.release();
        tracing::debug!(call_id = %task_call_id, "signaling driver stopped");
    });

    let handle = SignalingHandle {
        call_id,
        inputs,
        state,
        task: Some(task),
    };
    (handle, updates)
}

async fn next_signal(
    signals: &mut Option<broadcast::Receiver<TransportEvent>>,
    call_id: &str,
) -> SignalInput {
    loop {
        let Some(rx) = signals.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(event) => {
                let Some(kind) = SignalKind::from_event_name(&event.name) else {
                    continue;
                };
                match serde_json::from_value::<SignalMessage>(event.payload) {
                    Ok(message) if message.call_id == call_id => {
                        return SignalInput::Remote { kind, message };
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, error = %e, "unreadable signal dropped");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(call_id = %call_id, skipped, "signal receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::warn!(call_id = %call_id, "signal transport closed");
                *signals = None;
            }
        }
    }
}
