//! The per-session actor: one mailbox, one logical sequential process per
//! call attempt. It refreshes the signaling mirror, runs the pure transition
//! function, and executes the returned effects against the link, the
//! candidate buffer, the scheduler and the signaling channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use banter_proto::{ConnectionStatePayload, SignalPayload, UserId};

use crate::config::EngineConfig;
use crate::ice::{IceConfigProvider, IceDescriptor, IceTier, StaticIceConfig};
use crate::link::{CandidateInit, LinkEvent, LinkFactory, PeerLink, SessionSdp, TrackAttachment};
use crate::media::{acquire_with_fallback, AudioTrack, MediaConstraints, MediaSource};

use super::candidates::IceCandidateBuffer;
use super::monitor::{HealthTracker, HealthVerdict};
use super::negotiator::{transition, Effect, FsmState};
use super::{CallEvent, NegotiationRole, SessionEvent, TerminationReason, TimerKind};
use super::scheduler::SessionScheduler;

/// The actor's channel back into the wider engine: envelope sends (with ack
/// tracking) and end-of-life deregistration.
#[async_trait]
pub(crate) trait SessionOutbound: Send + Sync {
    async fn send_signal(&self, to: &UserId, signal: SignalPayload);
    fn session_finished(&self, remote: &UserId);
}

pub(crate) struct SessionContext {
    pub local: UserId,
    pub remote: UserId,
    pub config: EngineConfig,
    pub outbound: Arc<dyn SessionOutbound>,
    pub link_factory: Arc<dyn LinkFactory>,
    pub media: Arc<dyn MediaSource>,
    pub ice: Arc<dyn IceConfigProvider>,
    pub events: broadcast::Sender<CallEvent>,
}

pub(crate) struct PeerSessionActor {
    ctx: SessionContext,
    fsm: FsmState,
    link: Option<Arc<dyn PeerLink>>,
    link_task: Option<JoinHandle<()>>,
    buffer: IceCandidateBuffer,
    scheduler: SessionScheduler,
    health: HealthTracker,
    track: Option<AudioTrack>,
    announced_tier: IceTier,
    mailbox: mpsc::UnboundedReceiver<SessionEvent>,
    self_tx: mpsc::UnboundedSender<SessionEvent>,
    finished: bool,
}

impl PeerSessionActor {
    pub(crate) fn new(
        ctx: SessionContext,
        mailbox: mpsc::UnboundedReceiver<SessionEvent>,
        self_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let retry_cap = ctx.config.retry_cap;
        let scheduler = SessionScheduler::new(self_tx.clone());
        Self {
            ctx,
            fsm: FsmState::new(retry_cap),
            link: None,
            link_task: None,
            // The partner id is known from the moment the session exists.
            buffer: IceCandidateBuffer::new(true),
            scheduler,
            health: HealthTracker::default(),
            track: None,
            announced_tier: IceTier::Standard,
            mailbox,
            self_tx,
            finished: false,
        }
    }

    pub(crate) async fn run(mut self, role: NegotiationRole) {
        info!(
            local = %self.ctx.local,
            remote = %self.ctx.remote,
            ?role,
            "session starting"
        );

        if let Err(err) = self.install_link(IceTier::Standard).await {
            warn!(remote = %self.ctx.remote, error = %err, "initial link setup failed");
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
        }

        self.scheduler
            .arm(TimerKind::TierDeadline, self.ctx.config.tier_window);
        self.scheduler
            .arm(TimerKind::Heartbeat, self.ctx.config.heartbeat_interval);
        self.scheduler
            .arm(TimerKind::StatsTick, self.ctx.config.stats_interval);

        if matches!(role, NegotiationRole::Offering) {
            let _ = self.self_tx.send(SessionEvent::Start);
        }

        while let Some(event) = self.mailbox.recv().await {
            if let Some(link) = &self.link {
                self.fsm.signaling = link.signaling_state();
            }

            let previous_state = self.fsm.state;
            let step = transition(&self.fsm, &event);
            self.fsm = step.next;

            if self.fsm.state != previous_state {
                debug!(
                    remote = %self.ctx.remote,
                    from = ?previous_state,
                    to = ?self.fsm.state,
                    "session state changed"
                );
                let _ = self.ctx.events.send(CallEvent::StateChanged {
                    remote: self.ctx.remote.clone(),
                    state: self.fsm.state,
                });
            }

            for effect in step.effects {
                self.apply(effect).await;
                if self.finished {
                    break;
                }
            }
            if self.finished {
                break;
            }
        }

        // Closing the mailbox first lets the registry tell this finished
        // session apart from a successor that reused the same key.
        self.mailbox.close();
        self.ctx.outbound.session_finished(&self.ctx.remote);
        info!(remote = %self.ctx.remote, state = ?self.fsm.state, "session ended");
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::BeginOffer { ice_restart } => self.begin_offer(ice_restart).await,
            Effect::ApplyRemoteOffer(sdp) => self.apply_remote_offer(sdp).await,
            Effect::ApplyRemoteAnswer(sdp) => self.apply_remote_answer(sdp).await,
            Effect::AcceptRemoteCandidate(payload) => {
                let candidate: CandidateInit = payload.into();
                if let Some(ready) = self.buffer.push_remote(candidate) {
                    self.apply_remote_candidate(ready, true).await;
                }
            }
            Effect::RetryRemoteCandidate(candidate) => {
                self.apply_remote_candidate(candidate, false).await;
            }
            Effect::EnqueueLocalCandidate(candidate) => {
                if let Some(ready) = self.buffer.push_local(candidate) {
                    self.send_candidate(ready).await;
                }
            }
            Effect::SendConnectionState(phase) => {
                self.send_signal(SignalPayload::ConnectionState(ConnectionStatePayload {
                    phase,
                }))
                .await;
            }
            Effect::ArmTimer(kind) => {
                let delay = self.timer_delay(kind);
                self.scheduler.arm(kind, delay);
            }
            Effect::CancelTimer(kind) => self.scheduler.cancel(kind),
            Effect::CancelAllTimers => self.scheduler.cancel_all(),
            Effect::ResetLink => {
                let tier = self.fsm.tier;
                if let Err(err) = self.install_link(tier).await {
                    warn!(remote = %self.ctx.remote, error = %err, "link reset failed");
                }
            }
            Effect::EscalateTier(tier) => self.escalate_in_place(tier).await,
            Effect::RebuildLink(tier) => self.rebuild(tier).await,
            Effect::MuteOutbound => self.mute().await,
            Effect::UnmuteOutbound => self.unmute().await,
            Effect::RepairOutbound => {
                self.repair().await;
            }
            Effect::SendKeepalive => {
                if let Some(link) = &self.link {
                    if let Err(err) = link.send_keepalive().await {
                        debug!(remote = %self.ctx.remote, error = %err, "keepalive failed");
                    }
                }
            }
            Effect::SampleStats => self.sample_stats().await,
            Effect::CloseSession(reason) => self.close(reason).await,
        }
    }

    fn timer_delay(&self, kind: TimerKind) -> Duration {
        let config = &self.ctx.config;
        match kind {
            TimerKind::DeferredOffer => config.defer_delay,
            TimerKind::RetryBackoff => {
                // Jitter keeps both glare losers from colliding in lockstep.
                let jitter_ms = config.backoff_jitter.as_millis() as u64;
                let jitter = if jitter_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
                };
                config.backoff_base + jitter
            }
            TimerKind::TierDeadline => config.tier_window,
            TimerKind::Heartbeat => config.heartbeat_interval,
            TimerKind::StatsTick => config.stats_interval,
        }
    }

    async fn fetch_descriptor(&self, tier: IceTier) -> IceDescriptor {
        match self.ctx.ice.fetch(tier).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(%tier, error = %err, "ice config fetch failed; using static defaults");
                StaticIceConfig::descriptor(tier)
            }
        }
    }

    /// Tear down any current link and stand up a fresh one for `tier`.
    async fn install_link(&mut self, tier: IceTier) -> Result<(), crate::link::LinkError> {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.buffer.reset_for_rebuild();
        self.health.reset();

        let descriptor = self.fetch_descriptor(tier).await;
        let (link, mut events) = self.ctx.link_factory.create(&descriptor).await?;
        let tx = self.self_tx.clone();
        self.link_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mapped = match event {
                    LinkEvent::LocalCandidate(candidate) => {
                        SessionEvent::LocalCandidate(candidate)
                    }
                    LinkEvent::StateChanged(state) => SessionEvent::LinkStateChanged(state),
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        }));
        self.link = Some(link);
        Ok(())
    }

    async fn ensure_outbound_media(&mut self) -> bool {
        if self.fsm.muted || self.track.is_some() {
            return true;
        }
        let Some(link) = self.link.clone() else {
            return false;
        };
        match acquire_with_fallback(self.ctx.media.as_ref(), &MediaConstraints::default()).await {
            Ok(track) => match link.set_outbound_track(Some(track.clone())).await {
                Ok(_) => {
                    self.track = Some(track);
                    true
                }
                Err(err) => {
                    warn!(remote = %self.ctx.remote, error = %err, "failed to attach audio track");
                    self.ctx.media.release(track).await;
                    false
                }
            },
            Err(err) => {
                error!(remote = %self.ctx.remote, error = %err, "audio device unavailable");
                false
            }
        }
    }

    async fn begin_offer(&mut self, ice_restart: bool) {
        let Some(link) = self.link.clone() else {
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        };
        if !self.ensure_outbound_media().await {
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        }
        let result: Result<SessionSdp, crate::link::LinkError> = async {
            let offer = link.create_offer(ice_restart).await?;
            link.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;
        match result {
            Ok(offer) => {
                self.send_signal(SignalPayload::Offer(offer.to_payload())).await;
                for candidate in self.buffer.mark_local_description() {
                    self.send_candidate(candidate).await;
                }
                debug!(remote = %self.ctx.remote, ice_restart, "offer sent");
            }
            Err(err) => {
                warn!(remote = %self.ctx.remote, error = %err, "offer construction failed");
                let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            }
        }
    }

    async fn apply_remote_offer(&mut self, sdp: banter_proto::SdpPayload) {
        let Some(link) = self.link.clone() else {
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        };
        let description = match SessionSdp::from_payload(&sdp) {
            Ok(description) => description,
            Err(err) => {
                warn!(remote = %self.ctx.remote, error = %err, "malformed offer payload");
                return;
            }
        };
        if let Err(err) = link.set_remote_description(description).await {
            warn!(remote = %self.ctx.remote, error = %err, "failed to apply remote offer");
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        }
        for candidate in self.buffer.mark_remote_description() {
            self.apply_remote_candidate(candidate, true).await;
        }

        if !self.ensure_outbound_media().await {
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        }
        let result: Result<SessionSdp, crate::link::LinkError> = async {
            let answer = link.create_answer().await?;
            link.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;
        match result {
            Ok(answer) => {
                self.send_signal(SignalPayload::Answer(answer.to_payload())).await;
                for candidate in self.buffer.mark_local_description() {
                    self.send_candidate(candidate).await;
                }
                // Local signaling is back to stable: negotiation complete.
                self.fsm.negotiation_in_flight = false;
                debug!(remote = %self.ctx.remote, "answer sent");
            }
            Err(err) => {
                warn!(remote = %self.ctx.remote, error = %err, "answer construction failed");
                let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            }
        }
    }

    async fn apply_remote_answer(&mut self, sdp: banter_proto::SdpPayload) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let description = match SessionSdp::from_payload(&sdp) {
            Ok(description) => description,
            Err(err) => {
                warn!(remote = %self.ctx.remote, error = %err, "malformed answer payload");
                return;
            }
        };
        if let Err(err) = link.set_remote_description(description).await {
            warn!(remote = %self.ctx.remote, error = %err, "failed to apply answer");
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        }
        for candidate in self.buffer.mark_remote_description() {
            self.apply_remote_candidate(candidate, true).await;
        }
        self.fsm.negotiation_in_flight = false;
    }

    /// Apply one remote candidate; a first failure earns exactly one delayed
    /// retry, a second is logged as terminal.
    async fn apply_remote_candidate(&mut self, candidate: CandidateInit, first_attempt: bool) {
        let Some(link) = self.link.clone() else {
            return;
        };
        match link.add_remote_candidate(candidate.clone()).await {
            Ok(()) => {}
            Err(err) if first_attempt => {
                warn!(
                    remote = %self.ctx.remote,
                    candidate = %candidate.candidate,
                    error = %err,
                    "candidate failed to apply; scheduling retry"
                );
                self.scheduler.arm_oneshot(
                    self.ctx.config.candidate_retry_delay,
                    SessionEvent::RetryCandidate(candidate),
                );
            }
            Err(_) => {
                self.buffer.record_terminal_failure(&candidate);
            }
        }
    }

    async fn escalate_in_place(&mut self, tier: IceTier) {
        let descriptor = self.fetch_descriptor(tier).await;
        if let Some(link) = &self.link {
            if let Err(err) = link.apply_ice_config(&descriptor).await {
                warn!(remote = %self.ctx.remote, error = %err, "failed to refresh ice config");
            }
        }
        info!(remote = %self.ctx.remote, %tier, "escalated tier with in-place restart");
        self.announce_tier(tier);
    }

    fn announce_tier(&mut self, tier: IceTier) {
        if tier == self.announced_tier {
            return;
        }
        self.announced_tier = tier;
        let _ = self.ctx.events.send(CallEvent::TierEscalated {
            remote: self.ctx.remote.clone(),
            tier,
        });
    }

    async fn rebuild(&mut self, tier: IceTier) {
        info!(remote = %self.ctx.remote, %tier, "rebuilding session");
        if let Err(err) = self.install_link(tier).await {
            warn!(remote = %self.ctx.remote, error = %err, "rebuild failed");
            let _ = self.self_tx.send(SessionEvent::AttemptFailed);
            return;
        }
        self.announce_tier(tier);
        // Fresh link, fresh negotiation.
        let _ = self.self_tx.send(SessionEvent::Renegotiate);
    }

    async fn mute(&mut self) {
        if let Some(link) = &self.link {
            if let Err(err) = link.set_outbound_track(None).await {
                warn!(remote = %self.ctx.remote, error = %err, "failed to blank outbound track");
            }
        }
        if let Some(track) = self.track.take() {
            self.ctx.media.release(track).await;
        }
        debug!(remote = %self.ctx.remote, "muted");
    }

    async fn unmute(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        match acquire_with_fallback(self.ctx.media.as_ref(), &MediaConstraints::default()).await {
            Ok(track) => match link.set_outbound_track(Some(track.clone())).await {
                Ok(TrackAttachment::ReplacedExisting) => {
                    self.track = Some(track);
                    debug!(remote = %self.ctx.remote, "unmuted on existing sender");
                }
                Ok(TrackAttachment::AddedSender) => {
                    self.track = Some(track);
                    // A brand-new sender changes the transceiver set and must
                    // be negotiated; an existing one must not.
                    if matches!(self.fsm.state, super::SessionState::Connected) {
                        let _ = self.self_tx.send(SessionEvent::Renegotiate);
                    }
                }
                Err(err) => {
                    warn!(remote = %self.ctx.remote, error = %err, "failed to re-attach track");
                    self.ctx.media.release(track).await;
                    self.fsm.muted = true;
                }
            },
            Err(err) => {
                error!(remote = %self.ctx.remote, error = %err, "unmute failed: device unavailable");
                self.fsm.muted = true;
            }
        }
    }

    async fn repair(&mut self) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match link.repair_outbound(self.track.as_ref()).await {
            Ok(changed) => {
                if changed {
                    info!(remote = %self.ctx.remote, "non-destructive media repair applied");
                }
                changed
            }
            Err(err) => {
                debug!(remote = %self.ctx.remote, error = %err, "repair pass failed");
                false
            }
        }
    }

    async fn sample_stats(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let sample = match link.stats().await {
            Ok(sample) => sample,
            Err(err) => {
                debug!(remote = %self.ctx.remote, error = %err, "stats sampling failed");
                return;
            }
        };
        // Health accounting only applies once media is expected to flow:
        // before `connected` the tier windows govern recovery, and a muted
        // session has no outbound audio to miss.
        if !matches!(self.fsm.state, super::SessionState::Connected) || self.fsm.muted {
            self.health.reset();
            return;
        }
        match self.health.observe(sample) {
            HealthVerdict::Healthy => {}
            HealthVerdict::AttemptRepair => {
                self.repair().await;
            }
            HealthVerdict::CountFailure => {
                let _ = self.self_tx.send(SessionEvent::HealthCheckFailed);
            }
        }
    }

    async fn close(&mut self, reason: TerminationReason) {
        self.scheduler.cancel_all();
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        if let Some(track) = self.track.take() {
            self.ctx.media.release(track).await;
        }
        let _ = self.ctx.events.send(CallEvent::Terminated {
            remote: self.ctx.remote.clone(),
            reason,
        });
        self.finished = true;
    }

    async fn send_candidate(&self, candidate: CandidateInit) {
        self.send_signal(SignalPayload::IceCandidate(candidate.into()))
            .await;
    }

    async fn send_signal(&self, signal: SignalPayload) {
        self.ctx
            .outbound
            .send_signal(&self.ctx.remote, signal)
            .await;
    }
}
