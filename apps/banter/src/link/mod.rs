//! The RTC seam. The negotiator drives a [`PeerLink`] without knowing whether
//! a real webrtc peer connection or the in-memory mock is behind it.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use banter_proto::{CandidatePayload, SdpPayload};

use crate::ice::IceDescriptor;
use crate::media::AudioTrack;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Sdp(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("media attachment failed: {0}")]
    Media(String),
    #[error("link closed")]
    Closed,
}

/// Mirror of the underlying signaling state, the guard for every offer and
/// answer application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Coarse transport state as surfaced by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone)]
pub struct SessionSdp {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionSdp {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_payload(&self) -> SdpPayload {
        SdpPayload {
            sdp: self.sdp.clone(),
            typ: match self.kind {
                SdpKind::Offer => "offer".to_string(),
                SdpKind::Answer => "answer".to_string(),
            },
        }
    }

    pub fn from_payload(payload: &SdpPayload) -> Result<Self, LinkError> {
        match payload.typ.as_str() {
            "offer" => Ok(Self::offer(payload.sdp.clone())),
            "answer" => Ok(Self::answer(payload.sdp.clone())),
            other => Err(LinkError::Sdp(format!("unsupported sdp type {other}"))),
        }
    }
}

/// A trickled candidate in the shape the link consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl From<CandidatePayload> for CandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
        }
    }
}

impl From<CandidateInit> for CandidatePayload {
    fn from(init: CandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

/// Whether attaching a track reused an existing outbound sender. Reuse never
/// needs renegotiation; a brand-new sender does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackAttachment {
    ReplacedExisting,
    AddedSender,
}

/// One periodic metrics sample; input to the health policy only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub audio_bytes_sent: u64,
    pub selected_pair_succeeded: bool,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    LocalCandidate(CandidateInit),
    StateChanged(LinkState),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, LinkError>;
    async fn create_answer(&self) -> Result<SessionSdp, LinkError>;
    async fn set_local_description(&self, sdp: SessionSdp) -> Result<(), LinkError>;
    async fn set_remote_description(&self, sdp: SessionSdp) -> Result<(), LinkError>;
    fn signaling_state(&self) -> SignalingState;
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError>;
    /// Attach (`Some`) or blank (`None`) the outbound audio track.
    async fn set_outbound_track(
        &self,
        track: Option<AudioTrack>,
    ) -> Result<TrackAttachment, LinkError>;
    /// Non-destructive repair pass: re-attach a missing outbound track,
    /// re-enable what was disabled. Returns whether anything changed.
    async fn repair_outbound(&self, track: Option<&AudioTrack>) -> Result<bool, LinkError>;
    /// Adopt a refreshed traversal descriptor where the implementation can.
    async fn apply_ice_config(&self, descriptor: &IceDescriptor) -> Result<(), LinkError>;
    async fn stats(&self) -> Result<StatsSnapshot, LinkError>;
    /// Lightweight probe that exercises the transport between stat samples.
    async fn send_keepalive(&self) -> Result<(), LinkError>;
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(
        &self,
        descriptor: &IceDescriptor,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), LinkError>;
}
