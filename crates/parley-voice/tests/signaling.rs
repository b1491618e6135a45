//! Negotiation tests for the signaling machine over the loopback relay.

use std::sync::Arc;

use parley_crypto::{EncryptedEnvelope, MemoryKeychain, SealedPayload};
use parley_protocol::events::event;
use parley_protocol::{
    IceCandidate, LoopbackHub, LoopbackTransport, MemoryBackend, MessageCrypto,
    SessionDescription, SignalBody, SignalKind, SignalMessage,
};
use parley_voice::loopback::{LoopbackMedia, LoopbackPeerFactory};
use parley_voice::machine::MachineChannels;
use parley_voice::media::LocalAudioTrack;
use parley_voice::{
    spawn_signaling, CallParams, FailureReason, MediaError, Role, SignalInput, SignalUpdate,
    SignalingConfig, SignalingDeps, SignalingMachine, SignalingState,
};
use serde_json::json;
use tokio::sync::mpsc;

const CALL: &str = "call-1";

struct Side {
    crypto: Arc<MessageCrypto>,
    media: Arc<LoopbackMedia>,
    peers: Arc<LoopbackPeerFactory>,
    transport: LoopbackTransport,
}

impl Side {
    fn new(hub: &LoopbackHub, backend: &MemoryBackend, user: &str) -> Self {
        Self::with(hub, backend, user, LoopbackMedia::new(), LoopbackPeerFactory::new())
    }

    fn with(
        hub: &LoopbackHub,
        backend: &MemoryBackend,
        user: &str,
        media: LoopbackMedia,
        peers: LoopbackPeerFactory,
    ) -> Self {
        Self {
            crypto: Arc::new(MessageCrypto::new(
                user,
                Arc::new(MemoryKeychain::new()),
                Arc::new(backend.session(user)),
            )),
            media: Arc::new(media),
            peers: Arc::new(peers),
            transport: hub.connect(user),
        }
    }

    fn deps(&self) -> SignalingDeps {
        SignalingDeps {
            transport: Arc::new(self.transport.clone()),
            crypto: self.crypto.clone(),
            media: self.media.clone(),
            peers: self.peers.clone(),
        }
    }
}

fn params(role: Role, local: &str, peer: &str) -> CallParams {
    CallParams {
        call_id: CALL.into(),
        role,
        local_id: local.into(),
        peer_id: peer.into(),
    }
}

fn drain(updates: &mut mpsc::UnboundedReceiver<SignalUpdate>) -> Vec<SignalUpdate> {
    let mut out = Vec::new();
    while let Ok(update) = updates.try_recv() {
        out.push(update);
    }
    out
}

async fn pump(machine: &mut SignalingMachine, channels: &mut MachineChannels) {
    let input = channels.inputs.recv().await.unwrap();
    machine.handle(input).await;
}

fn clear_from_alice(body: SignalBody) -> SignalMessage {
    SignalMessage::seal(CALL, "alice", "bob", &body, SealedPayload::Clear(String::new())).unwrap()
}

fn remote(kind: SignalKind, message: SignalMessage) -> SignalInput {
    SignalInput::Remote { kind, message }
}

fn garbage_sealed() -> serde_json::Value {
    serde_json::to_value(SealedPayload::Encrypted(EncryptedEnvelope {
        ciphertext: vec![1, 2, 3],
        iv: vec![0; 12],
        auth_tag: vec![0; 16],
    }))
    .unwrap()
}

fn callee(bob: &Side) -> (SignalingMachine, MachineChannels) {
    SignalingMachine::new(
        params(Role::Callee, "bob", "alice"),
        bob.deps(),
        SignalingConfig::default(),
    )
}

// ── Caller ──

#[tokio::test(start_paused = true)]
async fn start_call_sends_encrypted_offer() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::new(&hub, &backend, "alice");
    let bob = Side::new(&hub, &backend, "bob");
    bob.crypto.ensure_initialized().await.unwrap();

    let (handle, _updates) = spawn_signaling(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );
    handle.start_call().unwrap();
    handle
        .wait_for_state(|s| *s == SignalingState::OfferSent)
        .await
        .unwrap();

    let offers = hub.emitted_named(event::CALL_OFFER);
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["encrypted"], true);
    assert_eq!(offers[0]["encryptedData"]["encrypted"], true);
    assert!(offers[0].get("offer").is_none());
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_fails_with_no_response() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::new(&hub, &backend, "alice");
    let _bob = Side::new(&hub, &backend, "bob");

    let (handle, mut updates) = spawn_signaling(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );
    handle.start_call().unwrap();
    let state = handle.wait_for_state(|s| s.is_terminal()).await.unwrap();

    assert_eq!(state, SignalingState::Failed);
    assert!(drain(&mut updates).contains(&SignalUpdate::Failed(FailureReason::NoResponse)));
    assert!(alice.media.last_track().unwrap().is_stopped());
    assert!(alice.peers.last_peer().unwrap().is_closed());
}

#[tokio::test]
async fn permission_denied_is_fatal_and_distinct() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::with(
        &hub,
        &backend,
        "alice",
        LoopbackMedia::failing(MediaError::PermissionDenied),
        LoopbackPeerFactory::new(),
    );

    let (handle, mut updates) = spawn_signaling(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );
    handle.start_call().unwrap();
    handle.wait_for_state(|s| s.is_terminal()).await.unwrap();

    assert!(drain(&mut updates).contains(&SignalUpdate::Failed(FailureReason::Media(
        MediaError::PermissionDenied
    ))));
    assert!(alice.peers.peers().is_empty());
    assert!(hub.emitted_named(event::CALL_OFFER).is_empty());
}

#[tokio::test]
async fn mute_only_toggles_the_track() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::new(&hub, &backend, "alice");
    let (mut machine, mut channels) = SignalingMachine::new(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );

    machine.handle(SignalInput::SetMuted(true)).await;
    machine.handle(SignalInput::StartCall).await;
    pump(&mut machine, &mut channels).await;
    assert_eq!(machine.state(), SignalingState::OfferSent);

    let track = alice.media.last_track().unwrap();
    assert!(!track.is_enabled());
    machine.handle(SignalInput::SetMuted(false)).await;
    assert!(track.is_enabled());

    assert_eq!(machine.state(), SignalingState::OfferSent);
    assert_eq!(alice.peers.last_peer().unwrap().offers_created(), vec![false]);
}

// ── Callee ──

#[tokio::test]
async fn answer_before_offer_then_queued_candidates_drain_in_order() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    for i in 1..=3 {
        let candidate = IceCandidate::new(format!("candidate:{i}"));
        machine
            .handle(remote(
                SignalKind::IceCandidate,
                clear_from_alice(SignalBody::Candidate(Some(candidate))),
            ))
            .await;
    }
    assert_eq!(machine.pending_candidates(), 3);

    machine.handle(SignalInput::AnswerCall).await;
    assert_eq!(machine.state(), SignalingState::GettingMedia);
    assert!(machine.should_answer());

    pump(&mut machine, &mut channels).await;
    assert_eq!(machine.state(), SignalingState::MediaReady);

    machine
        .handle(remote(
            SignalKind::Offer,
            clear_from_alice(SignalBody::Offer(SessionDescription::offer("v=0 alice"))),
        ))
        .await;
    assert_eq!(machine.state(), SignalingState::AnswerSent);

    let peer = bob.peers.last_peer().unwrap();
    assert_eq!(
        peer.added_candidates(),
        vec!["candidate:1", "candidate:2", "candidate:3"]
    );
    assert_eq!(machine.pending_candidates(), 0);
    assert_eq!(hub.emitted_named(event::CALL_ANSWER).len(), 1);
}

#[tokio::test]
async fn offer_during_media_acquisition_is_answered_once_ready() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    machine.handle(SignalInput::AnswerCall).await;
    machine
        .handle(remote(
            SignalKind::Offer,
            clear_from_alice(SignalBody::Offer(SessionDescription::offer("v=0"))),
        ))
        .await;
    assert_eq!(machine.state(), SignalingState::GettingMedia);
    assert!(machine.has_pending_offer());

    pump(&mut machine, &mut channels).await;
    assert_eq!(machine.state(), SignalingState::AnswerSent);
    assert!(!machine.has_pending_offer());
}

#[tokio::test]
async fn offer_before_accept_is_held() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    machine
        .handle(remote(
            SignalKind::Offer,
            clear_from_alice(SignalBody::Offer(SessionDescription::offer("v=0"))),
        ))
        .await;
    assert_eq!(machine.state(), SignalingState::Idle);
    assert!(hub.emitted_named(event::CALL_ANSWER).is_empty());

    machine.handle(SignalInput::AnswerCall).await;
    pump(&mut machine, &mut channels).await;
    assert_eq!(machine.state(), SignalingState::AnswerSent);
}

#[tokio::test]
async fn signals_for_other_calls_are_ignored() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, _channels) = callee(&bob);

    let body = SignalBody::Offer(SessionDescription::offer("v=0"));
    let other_call =
        SignalMessage::seal("call-9", "alice", "bob", &body, SealedPayload::Clear(String::new()))
            .unwrap();
    let other_sender =
        SignalMessage::seal(CALL, "mallory", "bob", &body, SealedPayload::Clear(String::new()))
            .unwrap();
    machine.handle(remote(SignalKind::Offer, other_call)).await;
    machine.handle(remote(SignalKind::Offer, other_sender)).await;

    assert!(!machine.has_pending_offer());
    assert!(machine.is_encrypted());
}

#[tokio::test(start_paused = true)]
async fn transient_remote_description_failures_are_retried() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::with(
        &hub,
        &backend,
        "bob",
        LoopbackMedia::new(),
        LoopbackPeerFactory::failing_remote_descriptions(2),
    );
    let (mut machine, mut channels) = callee(&bob);

    machine.handle(SignalInput::AnswerCall).await;
    pump(&mut machine, &mut channels).await;
    machine
        .handle(remote(
            SignalKind::Offer,
            clear_from_alice(SignalBody::Offer(SessionDescription::offer("v=0"))),
        ))
        .await;

    assert_eq!(machine.state(), SignalingState::AnswerSent);
    assert!(bob.peers.last_peer().unwrap().remote_description().is_some());
}

// ── Decoding fallbacks ──

#[tokio::test]
async fn unreadable_offer_falls_back_to_legacy_field() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    machine.handle(SignalInput::AnswerCall).await;
    pump(&mut machine, &mut channels).await;

    let message = SignalMessage {
        call_id: CALL.into(),
        from: "alice".into(),
        to: "bob".into(),
        encrypted: true,
        encrypted_data: Some(garbage_sealed()),
        offer: Some(json!({"type": "offer", "sdp": "v=0 legacy"})),
        answer: None,
        candidate: None,
    };
    machine.handle(remote(SignalKind::Offer, message)).await;

    assert_eq!(machine.state(), SignalingState::AnswerSent);
    assert!(!machine.is_encrypted());
    let applied = bob.peers.last_peer().unwrap().remote_description().unwrap();
    assert_eq!(applied.sdp, "v=0 legacy");
}

#[tokio::test]
async fn unreadable_offer_without_fallback_fails_secure_channel() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    machine.handle(SignalInput::AnswerCall).await;
    pump(&mut machine, &mut channels).await;

    let message = SignalMessage {
        call_id: CALL.into(),
        from: "alice".into(),
        to: "bob".into(),
        encrypted: true,
        encrypted_data: Some(garbage_sealed()),
        offer: None,
        answer: None,
        candidate: None,
    };
    machine.handle(remote(SignalKind::Offer, message)).await;

    assert_eq!(machine.state(), SignalingState::Failed);
    assert!(drain(&mut channels.updates)
        .iter()
        .any(|u| matches!(u, SignalUpdate::Failed(FailureReason::SecureChannel(_)))));
    assert!(bob.media.last_track().unwrap().is_stopped());
}

#[tokio::test]
async fn unreadable_candidate_is_dropped_with_warning() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    let message = SignalMessage {
        call_id: CALL.into(),
        from: "alice".into(),
        to: "bob".into(),
        encrypted: true,
        encrypted_data: Some(garbage_sealed()),
        offer: None,
        answer: None,
        candidate: None,
    };
    machine.handle(remote(SignalKind::IceCandidate, message)).await;

    assert_eq!(machine.state(), SignalingState::Idle);
    assert_eq!(machine.pending_candidates(), 0);
    assert!(drain(&mut channels.updates)
        .iter()
        .any(|u| matches!(u, SignalUpdate::Warning(_))));
}

// ── Teardown ──

#[tokio::test]
async fn hangup_releases_everything_once() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let bob = Side::new(&hub, &backend, "bob");
    let (mut machine, mut channels) = callee(&bob);

    machine.handle(SignalInput::AnswerCall).await;
    pump(&mut machine, &mut channels).await;
    machine
        .handle(remote(
            SignalKind::Offer,
            clear_from_alice(SignalBody::Offer(SessionDescription::offer("v=0"))),
        ))
        .await;
    assert_eq!(machine.state(), SignalingState::AnswerSent);

    machine.handle(SignalInput::Hangup).await;
    assert_eq!(machine.state(), SignalingState::Ended);
    assert!(bob.media.last_track().unwrap().is_stopped());
    assert!(bob.peers.last_peer().unwrap().is_closed());

    machine.release();
    machine.handle(SignalInput::AnswerCall).await;
    machine.handle(SignalInput::Hangup).await;
    assert_eq!(machine.state(), SignalingState::Ended);
    assert_eq!(bob.media.tracks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_hangs_up() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::new(&hub, &backend, "alice");

    let (handle, _updates) = spawn_signaling(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );
    handle.start_call().unwrap();
    handle
        .wait_for_state(|s| *s == SignalingState::OfferSent)
        .await
        .unwrap();

    let mut state = handle.watch_state();
    drop(handle);
    state.wait_for(|s| s.is_terminal()).await.unwrap();

    assert_eq!(*state.borrow(), SignalingState::Ended);
    assert!(alice.media.last_track().unwrap().is_stopped());
}

// ── Both ends ──

async fn run_call(alice: &Side, bob: &Side) -> (Vec<SignalUpdate>, Vec<SignalUpdate>) {
    let (bob_handle, mut bob_updates) = spawn_signaling(
        params(Role::Callee, "bob", "alice"),
        bob.deps(),
        SignalingConfig::default(),
    );
    let (alice_handle, mut alice_updates) = spawn_signaling(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );

    bob_handle.answer_call().unwrap();
    alice_handle.start_call().unwrap();

    let alice_state = alice_handle.wait_for_state(|s| *s == SignalingState::Connected || s.is_terminal());
    let bob_state = bob_handle.wait_for_state(|s| *s == SignalingState::Connected || s.is_terminal());
    let (a, b) = tokio::join!(alice_state, bob_state);
    assert_eq!(a.unwrap(), SignalingState::Connected);
    assert_eq!(b.unwrap(), SignalingState::Connected);

    (drain(&mut alice_updates), drain(&mut bob_updates))
}

#[tokio::test(start_paused = true)]
async fn happy_path_connects_end_to_end_encrypted() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::new(&hub, &backend, "alice");
    let bob = Side::new(&hub, &backend, "bob");
    alice.crypto.ensure_initialized().await.unwrap();
    bob.crypto.ensure_initialized().await.unwrap();

    let (alice_updates, bob_updates) = run_call(&alice, &bob).await;

    for updates in [&alice_updates, &bob_updates] {
        assert!(!updates.contains(&SignalUpdate::Encryption { encrypted: false }));
        assert!(!updates.iter().any(|u| matches!(u, SignalUpdate::Failed(_))));
    }
    assert!(alice_updates.contains(&SignalUpdate::State(SignalingState::AnswerReceived)));
    assert!(bob_updates.contains(&SignalUpdate::State(SignalingState::OfferReceived)));

    for name in [event::CALL_OFFER, event::CALL_ANSWER, event::CALL_ICE_CANDIDATE] {
        for payload in hub.emitted_named(name) {
            assert_eq!(payload["encrypted"], true, "{name} sent in clear");
        }
    }
    assert!(alice.peers.last_peer().unwrap().is_connected());
    assert!(bob.peers.last_peer().unwrap().is_connected());
}

#[tokio::test(start_paused = true)]
async fn missing_peer_keys_fall_back_to_clear_signaling() {
    let hub = LoopbackHub::new();
    // Separate directories: neither side can find the other's key
    let alice = Side::new(&hub, &MemoryBackend::new(), "alice");
    let bob = Side::new(&hub, &MemoryBackend::new(), "bob");

    let (alice_updates, bob_updates) = run_call(&alice, &bob).await;

    assert!(alice_updates.contains(&SignalUpdate::Encryption { encrypted: false }));
    assert!(bob_updates.contains(&SignalUpdate::Encryption { encrypted: false }));

    let offer = &hub.emitted_named(event::CALL_OFFER)[0];
    assert_eq!(offer["encrypted"], false);
    assert_eq!(offer["offer"]["type"], "offer");
}

#[tokio::test(start_paused = true)]
async fn ice_restarts_are_bounded_then_fail() {
    let hub = LoopbackHub::new();
    let backend = MemoryBackend::new();
    let alice = Side::with(
        &hub,
        &backend,
        "alice",
        LoopbackMedia::new(),
        LoopbackPeerFactory::without_connectivity(),
    );
    let bob = Side::with(
        &hub,
        &backend,
        "bob",
        LoopbackMedia::new(),
        LoopbackPeerFactory::without_connectivity(),
    );

    let (bob_handle, mut bob_updates) = spawn_signaling(
        params(Role::Callee, "bob", "alice"),
        bob.deps(),
        SignalingConfig::default(),
    );
    let (alice_handle, mut alice_updates) = spawn_signaling(
        params(Role::Caller, "alice", "bob"),
        alice.deps(),
        SignalingConfig::default(),
    );
    bob_handle.answer_call().unwrap();
    alice_handle.start_call().unwrap();

    let (a, b) = tokio::join!(
        alice_handle.wait_for_state(|s| s.is_terminal()),
        bob_handle.wait_for_state(|s| s.is_terminal())
    );
    assert_eq!(a.unwrap(), SignalingState::Failed);
    assert_eq!(b.unwrap(), SignalingState::Failed);

    assert_eq!(
        alice.peers.last_peer().unwrap().offers_created(),
        vec![false, true, true]
    );
    assert!(drain(&mut alice_updates)
        .contains(&SignalUpdate::Failed(FailureReason::ConnectionTimeout)));
    assert!(drain(&mut bob_updates)
        .contains(&SignalUpdate::Failed(FailureReason::ConnectionTimeout)));
}
