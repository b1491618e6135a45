//! In-process media and peer-connection implementations.
//!
//! Suitable for testing and the headless demo. A [`LoopbackPeer`] reports
//! `Connected` once it has a local description, a remote description and at
//! least one remote candidate, which is enough to drive the signaling
//! machine through a full negotiation without a network.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::{MediaError, VoiceError};
use crate::media::{LocalAudioTrack, MediaDevices};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};

pub struct LoopbackTrack {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LoopbackTrack {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalAudioTrack for LoopbackTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct LoopbackMedia {
    failure: Option<MediaError>,
    tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capture attempt fails with `error`.
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        self.tracks.lock().clone()
    }

    pub fn last_track(&self) -> Option<Arc<LoopbackTrack>> {
        self.tracks.lock().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn get_user_audio(&self) -> Result<Arc<dyn LocalAudioTrack>, MediaError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let track = Arc::new(LoopbackTrack::new());
        self.tracks.lock().push(track.clone());
        Ok(track)
    }
}

#[derive(Default)]
struct PeerInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    offers: Vec<bool>,
    tracks: usize,
    connected: bool,
    closed: bool,
}

pub struct LoopbackPeer {
    id: u32,
    events: mpsc::UnboundedSender<PeerEvent>,
    connectivity: Arc<AtomicBool>,
    remote_failures: AtomicU32,
    inner: Mutex<PeerInner>,
}

impl LoopbackPeer {
    /// Remote candidates applied, in order.
    pub fn added_candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    /// One entry per created offer: whether it was an ICE restart.
    pub fn offers_created(&self) -> Vec<bool> {
        self.inner.lock().offers.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().tracks
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn emit(&self, event: PeerEvent) {
        // The machine may already be gone during teardown
        let _ = self.events.send(event);
    }

    fn check_open(&self) -> Result<(), VoiceError> {
        if self.inner.lock().closed {
            return Err(VoiceError::PeerConnection("connection is closed".into()));
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let mut inner = self.inner.lock();
        let ready = inner.local.is_some() && inner.remote.is_some() && !inner.candidates.is_empty();
        if ready && !inner.connected && self.connectivity.load(Ordering::SeqCst) {
            inner.connected = true;
            drop(inner);
            self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_track(&self, _track: Arc<dyn LocalAudioTrack>) -> Result<(), VoiceError> {
        self.check_open()?;
        self.inner.lock().tracks += 1;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, VoiceError> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        inner.offers.push(ice_restart);
        if ice_restart {
            inner.connected = false;
        }
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=loopback {} {} IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.id,
            inner.offers.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        self.check_open()?;
        if self.inner.lock().remote.is_none() {
            return Err(VoiceError::PeerConnection("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.id
        )))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), VoiceError> {
        self.check_open()?;
        self.inner.lock().local = Some(desc.clone());
        let port = 50_000 + self.id;
        self.emit(PeerEvent::LocalCandidate(Some(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
            self.id
        )))));
        self.emit(PeerEvent::LocalCandidate(None));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), VoiceError> {
        self.check_open()?;
        let failed = self
            .remote_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(VoiceError::PeerConnection(
                "transient failure applying remote description".into(),
            ));
        }
        self.inner.lock().remote = Some(desc.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), VoiceError> {
        self.check_open()?;
        {
            let mut inner = self.inner.lock();
            if inner.remote.is_none() {
                return Err(VoiceError::PeerConnection(
                    "candidate before remote description".into(),
                ));
            }
            inner.candidates.push(candidate.clone());
        }
        self.maybe_connect();
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            inner.connected = false;
            drop(inner);
            self.emit(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        }
    }
}

pub struct LoopbackPeerFactory {
    connectivity: Arc<AtomicBool>,
    remote_failures: u32,
    next_id: AtomicU32,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl Default for LoopbackPeerFactory {
    fn default() -> Self {
        Self {
            connectivity: Arc::new(AtomicBool::new(true)),
            remote_failures: 0,
            next_id: AtomicU32::new(1),
            peers: Mutex::new(Vec::new()),
        }
    }
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers never reach `Connected`.
    pub fn without_connectivity() -> Self {
        let factory = Self::default();
        factory.connectivity.store(false, Ordering::SeqCst);
        factory
    }

    /// Each new peer fails its first `n` remote description attempts.
    pub fn failing_remote_descriptions(n: u32) -> Self {
        Self {
            remote_failures: n,
            ..Self::default()
        }
    }

    pub fn set_connectivity(&self, enabled: bool) {
        self.connectivity.store(enabled, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().last().cloned()
    }
}

impl PeerConnectionFactory for LoopbackPeerFactory {
    fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, VoiceError> {
        let peer = Arc::new(LoopbackPeer {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            events,
            connectivity: self.connectivity.clone(),
            remote_failures: AtomicU32::new(self.remote_failures),
            inner: Mutex::new(PeerInner::default()),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
