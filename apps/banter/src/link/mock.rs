//! Deterministic in-memory [`PeerLink`] used by the engine tests. Mirrors the
//! signaling-state rules of a real peer connection without any networking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ice::IceDescriptor;
use crate::media::AudioTrack;

use super::{
    CandidateInit, LinkError, LinkEvent, LinkFactory, LinkState, PeerLink, SdpKind, SessionSdp,
    SignalingState, StatsSnapshot, TrackAttachment,
};

#[derive(Default)]
struct MockLinkInner {
    signaling: Mutex<SignalingState>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    remote_candidates: Mutex<Vec<CandidateInit>>,
    candidate_failures: Mutex<HashMap<String, u32>>,
    outbound_track: Mutex<Option<AudioTrack>>,
    sender_exists: AtomicBool,
    sender_blanked: AtomicBool,
    keepalives: AtomicU64,
    offers_created: AtomicU64,
    restart_offers: AtomicU64,
    answers_created: AtomicU64,
    repairs: AtomicU64,
    local_candidate_serial: AtomicU64,
    stats_bytes: AtomicU64,
    connectable: AtomicBool,
    connected_emitted: AtomicBool,
    closed: AtomicBool,
    forced_stats: Mutex<Option<StatsSnapshot>>,
}

pub struct MockLink {
    inner: Arc<MockLinkInner>,
}

/// Test-side handle onto one mock link; lets a test script failures and
/// inject transport events.
#[derive(Clone)]
pub struct MockLinkHandle {
    inner: Arc<MockLinkInner>,
    pub descriptor: IceDescriptor,
}

impl MockLinkHandle {
    pub fn fire_state(&self, state: LinkState) {
        if let Some(tx) = self.inner.events.lock().unwrap().as_ref() {
            let _ = tx.send(LinkEvent::StateChanged(state));
        }
    }

    pub fn fire_local_candidate(&self, candidate: &str) {
        if let Some(tx) = self.inner.events.lock().unwrap().as_ref() {
            let _ = tx.send(LinkEvent::LocalCandidate(CandidateInit {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        }
    }

    /// Make `candidate` fail to apply `times` times before succeeding.
    pub fn fail_candidate(&self, candidate: &str, times: u32) {
        self.inner
            .candidate_failures
            .lock()
            .unwrap()
            .insert(candidate.to_string(), times);
    }

    pub fn set_connectable(&self, connectable: bool) {
        self.inner.connectable.store(connectable, Ordering::SeqCst);
    }

    /// Pin the stats report; until called, a connected link reports healthy,
    /// flowing audio.
    pub fn set_stats(&self, stats: StatsSnapshot) {
        *self.inner.forced_stats.lock().unwrap() = Some(stats);
    }

    pub fn applied_remote_candidates(&self) -> Vec<CandidateInit> {
        self.inner.remote_candidates.lock().unwrap().clone()
    }

    pub fn offers_created(&self) -> u64 {
        self.inner.offers_created.load(Ordering::SeqCst)
    }

    pub fn restart_offers(&self) -> u64 {
        self.inner.restart_offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> u64 {
        self.inner.answers_created.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> u64 {
        self.inner.keepalives.load(Ordering::SeqCst)
    }

    pub fn repairs(&self) -> u64 {
        self.inner.repairs.load(Ordering::SeqCst)
    }

    pub fn sender_exists(&self) -> bool {
        self.inner.sender_exists.load(Ordering::SeqCst)
    }

    pub fn sender_blanked(&self) -> bool {
        self.inner.sender_blanked.load(Ordering::SeqCst)
    }

    pub fn outbound_track_id(&self) -> Option<String> {
        self.inner
            .outbound_track
            .lock()
            .unwrap()
            .as_ref()
            .map(|track| track.id().to_string())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl MockLink {
    fn emit(&self, event: LinkEvent) {
        if let Some(tx) = self.inner.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Once negotiation has settled and at least one remote candidate is in,
    /// a connectable link reports `Connected` exactly once.
    fn maybe_connect(&self) {
        if !self.inner.connectable.load(Ordering::SeqCst) {
            return;
        }
        let stable = matches!(
            *self.inner.signaling.lock().unwrap(),
            SignalingState::Stable
        );
        let negotiated = self.inner.offers_created.load(Ordering::SeqCst) > 0
            || self.inner.answers_created.load(Ordering::SeqCst) > 0;
        let has_candidate = !self.inner.remote_candidates.lock().unwrap().is_empty();
        if stable
            && negotiated
            && has_candidate
            && !self.inner.connected_emitted.swap(true, Ordering::SeqCst)
        {
            self.emit(LinkEvent::StateChanged(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, LinkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let serial = self.inner.offers_created.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.inner.restart_offers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionSdp::offer(format!("mock-offer-{serial}")))
    }

    async fn create_answer(&self) -> Result<SessionSdp, LinkError> {
        if !matches!(
            *self.inner.signaling.lock().unwrap(),
            SignalingState::HaveRemoteOffer
        ) {
            return Err(LinkError::Sdp(
                "cannot create answer without a remote offer".into(),
            ));
        }
        let serial = self.inner.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionSdp::answer(format!("mock-answer-{serial}")))
    }

    async fn set_local_description(&self, sdp: SessionSdp) -> Result<(), LinkError> {
        let mut signaling = self.inner.signaling.lock().unwrap();
        *signaling = match (sdp.kind, *signaling) {
            // Re-setting a local offer (e.g. an ICE restart) is legal.
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, state) => {
                return Err(LinkError::Sdp(format!(
                    "cannot set local {kind:?} in {state:?}"
                )))
            }
        };
        drop(signaling);
        // Trickle two gathered candidates per applied local description, the
        // way a real agent would after setLocalDescription.
        for _ in 0..2 {
            let serial = self
                .inner
                .local_candidate_serial
                .fetch_add(1, Ordering::SeqCst);
            self.emit(LinkEvent::LocalCandidate(CandidateInit {
                candidate: format!("candidate:{serial} 1 udp 2113937151 10.0.0.2 {} typ host", 50_000 + serial),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionSdp) -> Result<(), LinkError> {
        let mut signaling = self.inner.signaling.lock().unwrap();
        *signaling = match (sdp.kind, *signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, state) => {
                return Err(LinkError::Sdp(format!(
                    "cannot set remote {kind:?} in {state:?}"
                )))
            }
        };
        drop(signaling);
        self.maybe_connect();
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.inner.signaling.lock().unwrap()
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError> {
        let mut failures = self.inner.candidate_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&candidate.candidate) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LinkError::Candidate(format!(
                    "scripted failure for {}",
                    candidate.candidate
                )));
            }
        }
        drop(failures);
        self.inner
            .remote_candidates
            .lock()
            .unwrap()
            .push(candidate);
        self.maybe_connect();
        Ok(())
    }

    async fn set_outbound_track(
        &self,
        track: Option<AudioTrack>,
    ) -> Result<TrackAttachment, LinkError> {
        match track {
            Some(track) => {
                *self.inner.outbound_track.lock().unwrap() = Some(track);
                self.inner.sender_blanked.store(false, Ordering::SeqCst);
                if self.inner.sender_exists.swap(true, Ordering::SeqCst) {
                    Ok(TrackAttachment::ReplacedExisting)
                } else {
                    Ok(TrackAttachment::AddedSender)
                }
            }
            None => {
                *self.inner.outbound_track.lock().unwrap() = None;
                if self.inner.sender_exists.load(Ordering::SeqCst) {
                    self.inner.sender_blanked.store(true, Ordering::SeqCst);
                }
                Ok(TrackAttachment::ReplacedExisting)
            }
        }
    }

    async fn repair_outbound(&self, track: Option<&AudioTrack>) -> Result<bool, LinkError> {
        let blanked = self.inner.sender_blanked.load(Ordering::SeqCst);
        let missing = self.inner.outbound_track.lock().unwrap().is_none();
        if self.inner.sender_exists.load(Ordering::SeqCst) && (blanked || missing) {
            if let Some(track) = track {
                *self.inner.outbound_track.lock().unwrap() = Some(track.clone());
                self.inner.sender_blanked.store(false, Ordering::SeqCst);
                self.inner.repairs.fetch_add(1, Ordering::SeqCst);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn apply_ice_config(&self, _descriptor: &IceDescriptor) -> Result<(), LinkError> {
        Ok(())
    }

    async fn stats(&self) -> Result<StatsSnapshot, LinkError> {
        if let Some(forced) = *self.inner.forced_stats.lock().unwrap() {
            return Ok(forced);
        }
        if self.inner.connected_emitted.load(Ordering::SeqCst) {
            let bytes = self.inner.stats_bytes.fetch_add(1_000, Ordering::SeqCst) + 1_000;
            Ok(StatsSnapshot {
                audio_bytes_sent: bytes,
                selected_pair_succeeded: true,
            })
        } else {
            Ok(StatsSnapshot::default())
        }
    }

    async fn send_keepalive(&self) -> Result<(), LinkError> {
        self.inner.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory that records every link it creates so tests can inspect and drive
/// them after the fact.
pub struct MockLinkFactory {
    connectable: bool,
    handles: Mutex<Vec<MockLinkHandle>>,
}

impl MockLinkFactory {
    /// Links auto-connect once negotiation and one candidate land.
    pub fn connectable() -> Self {
        Self {
            connectable: true,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Links never reach `Connected` on their own; the escalation policy is
    /// in charge.
    pub fn unconnectable() -> Self {
        Self {
            connectable: false,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn handles(&self) -> Vec<MockLinkHandle> {
        self.handles.lock().unwrap().clone()
    }

    pub fn links_created(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Tiers of the descriptors used for each created link, in order.
    pub fn tiers_seen(&self) -> Vec<crate::ice::IceTier> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|handle| handle.descriptor.tier)
            .collect()
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn create(
        &self,
        descriptor: &IceDescriptor,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MockLinkInner::default());
        inner.connectable.store(self.connectable, Ordering::SeqCst);
        *inner.events.lock().unwrap() = Some(events_tx);
        let handle = MockLinkHandle {
            inner: inner.clone(),
            descriptor: descriptor.clone(),
        };
        self.handles.lock().unwrap().push(handle);
        Ok((Arc::new(MockLink { inner }), events_rx))
    }
}
