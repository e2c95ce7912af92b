//! Production [`PeerLink`] backed by the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use crate::ice::{IceDescriptor, TransportPolicy};
use crate::media::AudioTrack;

use super::{
    CandidateInit, LinkError, LinkEvent, LinkFactory, LinkState, PeerLink, SdpKind, SessionSdp,
    SignalingState, StatsSnapshot, TrackAttachment,
};

fn to_setup_error(err: webrtc::Error) -> LinkError {
    LinkError::Setup(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, LinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = webrtc::interceptor::registry::Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(descriptor: &IceDescriptor) -> RTCConfiguration {
    let ice_servers = descriptor
        .servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    let ice_transport_policy = match descriptor.policy {
        TransportPolicy::All => RTCIceTransportPolicy::All,
        TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
    };
    RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        ..Default::default()
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    audio_sender: AsyncRwLock<Option<Arc<RTCRtpSender>>>,
    keepalive_channel: Arc<RTCDataChannel>,
    refreshed_descriptor: AsyncRwLock<Option<IceDescriptor>>,
}

pub struct WebRtcLinkFactory;

impl WebRtcLinkFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebRtcLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        descriptor: &IceDescriptor,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(descriptor))
                .await
                .map_err(to_setup_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // End-of-gathering marker.
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx.send(LinkEvent::LocalCandidate(CandidateInit {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        warn!(target = "link", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let pc_state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = pc_state_tx.clone();
            Box::pin(async move {
                debug!(target = "link", ?state, "peer connection state changed");
                let mapped = match state {
                    RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                    RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = tx.send(LinkEvent::StateChanged(state));
                }
            })
        }));

        let ice_state_tx = events_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = ice_state_tx.clone();
            Box::pin(async move {
                debug!(target = "link", ?state, "ice connection state changed");
                let mapped = match state {
                    RTCIceConnectionState::Checking => Some(LinkState::Checking),
                    RTCIceConnectionState::Completed => Some(LinkState::Completed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = tx.send(LinkEvent::StateChanged(state));
                }
            })
        }));

        // Unreliable side channel used purely to exercise the transport
        // between stat samples.
        let keepalive_channel = pc
            .create_data_channel(
                "banter-keepalive",
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .map_err(to_setup_error)?;

        info!(
            target = "link",
            tier = %descriptor.tier,
            servers = descriptor.servers.len(),
            "created peer link"
        );

        let link = Arc::new(WebRtcLink {
            pc,
            audio_sender: AsyncRwLock::new(None),
            keepalive_channel,
            refreshed_descriptor: AsyncRwLock::new(None),
        });
        Ok((link, events_rx))
    }
}

impl WebRtcLink {
    fn description(sdp: &SessionSdp) -> Result<RTCSessionDescription, LinkError> {
        match sdp.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp.clone())
                .map_err(|err| LinkError::Sdp(err.to_string())),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp.clone())
                .map_err(|err| LinkError::Sdp(err.to_string())),
        }
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, LinkError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|err| LinkError::Sdp(err.to_string()))?;
        Ok(SessionSdp::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionSdp, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| LinkError::Sdp(err.to_string()))?;
        Ok(SessionSdp::answer(answer.sdp))
    }

    async fn set_local_description(&self, sdp: SessionSdp) -> Result<(), LinkError> {
        let description = Self::description(&sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| LinkError::Sdp(err.to_string()))
    }

    async fn set_remote_description(&self, sdp: SessionSdp) -> Result<(), LinkError> {
        let description = Self::description(&sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| LinkError::Sdp(err.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            _ => SignalingState::Closed,
        }
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| LinkError::Candidate(err.to_string()))
    }

    async fn set_outbound_track(
        &self,
        track: Option<AudioTrack>,
    ) -> Result<TrackAttachment, LinkError> {
        let rtp = match &track {
            Some(track) => Some(track.as_rtp().ok_or_else(|| {
                LinkError::Media("synthetic track attached to a live link".into())
            })?),
            None => None,
        };

        let mut sender_guard = self.audio_sender.write().await;
        match (&*sender_guard, rtp) {
            (Some(sender), rtp) => {
                sender
                    .replace_track(rtp.map(|t| t as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(|err| LinkError::Media(err.to_string()))?;
                Ok(TrackAttachment::ReplacedExisting)
            }
            (None, Some(rtp)) => {
                let sender = self
                    .pc
                    .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|err| LinkError::Media(err.to_string()))?;
                *sender_guard = Some(sender);
                Ok(TrackAttachment::AddedSender)
            }
            // Blanking with no sender attached yet is a no-op.
            (None, None) => Ok(TrackAttachment::ReplacedExisting),
        }
    }

    async fn repair_outbound(&self, track: Option<&AudioTrack>) -> Result<bool, LinkError> {
        let sender_guard = self.audio_sender.read().await;
        let Some(sender) = sender_guard.as_ref() else {
            return Ok(false);
        };
        if sender.track().await.is_some() {
            return Ok(false);
        }
        let Some(rtp) = track.and_then(AudioTrack::as_rtp) else {
            return Ok(false);
        };
        sender
            .replace_track(Some(rtp as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|err| LinkError::Media(err.to_string()))?;
        info!(target = "link", "re-attached missing outbound audio track");
        Ok(true)
    }

    async fn apply_ice_config(&self, descriptor: &IceDescriptor) -> Result<(), LinkError> {
        // A live agent cannot swap its server set; the refreshed descriptor
        // takes effect at the next rebuild.
        info!(
            target = "link",
            tier = %descriptor.tier,
            servers = descriptor.servers.len(),
            "stored refreshed ice descriptor"
        );
        *self.refreshed_descriptor.write().await = Some(descriptor.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<StatsSnapshot, LinkError> {
        let report = self.pc.get_stats().await;
        let mut snapshot = StatsSnapshot::default();
        let mut outbound_rtp_bytes: Option<u64> = None;
        let mut nominated_pair_bytes = 0u64;
        for value in report.reports.values() {
            match value {
                StatsReportType::OutboundRTP(outbound) => {
                    *outbound_rtp_bytes.get_or_insert(0) += outbound.bytes_sent;
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    snapshot.selected_pair_succeeded = true;
                    nominated_pair_bytes = nominated_pair_bytes.max(pair.bytes_sent);
                }
                _ => {}
            }
        }
        // Audio-only session: the nominated pair carries the media when no
        // per-track outbound report is available.
        snapshot.audio_bytes_sent = outbound_rtp_bytes.unwrap_or(nominated_pair_bytes);
        Ok(snapshot)
    }

    async fn send_keepalive(&self) -> Result<(), LinkError> {
        self.keepalive_channel
            .send(&Bytes::from_static(b"ka"))
            .await
            .map(|_| ())
            .map_err(|err| LinkError::Setup(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(target = "link", error = %err, "error closing peer connection");
        }
    }
}
