//! The negotiation state machine as a pure transition function: given the
//! current state and one event it returns the next state and a list of
//! effects. The session actor executes the effects; nothing here touches the
//! network, timers or the link.

use banter_proto::{
    CandidatePayload, ConnectionPhase, EnvelopeKind, RelayRejection, SdpPayload,
};

use crate::ice::IceTier;
use crate::link::{CandidateInit, LinkState, SignalingState};

use super::monitor::{self, RecoveryAction};
use super::{
    NegotiationRole, SessionCommand, SessionEvent, SessionState, TerminationReason, TimerKind,
};

/// The portion of session state the transition function reads and rewrites.
/// `signaling` mirrors the link and is refreshed by the actor before every
/// transition.
#[derive(Debug, Clone)]
pub struct FsmState {
    pub state: SessionState,
    pub signaling: SignalingState,
    /// The glare guard: at most one offer may be outstanding per session.
    pub negotiation_in_flight: bool,
    pub retry_count: u32,
    pub tier: IceTier,
    pub muted: bool,
    /// The next offer should carry an ICE restart.
    pub pending_restart: bool,
    pub retry_cap: u32,
}

impl FsmState {
    pub fn new(retry_cap: u32) -> Self {
        Self {
            state: SessionState::Idle,
            signaling: SignalingState::Stable,
            negotiation_in_flight: false,
            retry_count: 0,
            tier: IceTier::Standard,
            muted: false,
            pending_restart: false,
            retry_cap,
        }
    }
}

/// Side effects requested by a transition, executed in order by the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create and send an offer (media attached first unless muted).
    BeginOffer { ice_restart: bool },
    /// Apply a remote offer, flush candidates, answer it.
    ApplyRemoteOffer(SdpPayload),
    ApplyRemoteAnswer(SdpPayload),
    AcceptRemoteCandidate(CandidatePayload),
    RetryRemoteCandidate(CandidateInit),
    EnqueueLocalCandidate(CandidateInit),
    SendConnectionState(ConnectionPhase),
    ArmTimer(TimerKind),
    CancelTimer(TimerKind),
    CancelAllTimers,
    /// Tear the link down and recreate it at the same tier.
    ResetLink,
    /// Refresh config for the tier and restart in place.
    EscalateTier(IceTier),
    /// Refresh config for the tier and rebuild the session from scratch.
    RebuildLink(IceTier),
    MuteOutbound,
    UnmuteOutbound,
    RepairOutbound,
    SendKeepalive,
    SampleStats,
    /// Release everything and leave the actor loop.
    CloseSession(TerminationReason),
}

pub struct Step {
    pub next: FsmState,
    pub effects: Vec<Effect>,
}

fn offer_guard_blocks(fsm: &FsmState) -> bool {
    fsm.negotiation_in_flight
        || !matches!(
            fsm.signaling,
            SignalingState::Stable | SignalingState::HaveRemoteOffer
        )
}

/// Count a failed attempt and either give up at the cap or restart from
/// scratch after a backoff. Glare, signaling confusion, peer-unavailable and
/// link failures all converge here.
fn fail_attempt(mut next: FsmState) -> Step {
    next.negotiation_in_flight = false;
    next.retry_count += 1;
    if next.retry_count > next.retry_cap {
        next.state = SessionState::Failed;
        return Step {
            next,
            effects: vec![
                Effect::CancelAllTimers,
                Effect::CloseSession(TerminationReason::RetryCapExceeded),
            ],
        };
    }
    if !matches!(next.state, SessionState::Connected) {
        next.state = SessionState::Negotiating(NegotiationRole::Offering);
    }
    Step {
        next,
        effects: vec![Effect::ResetLink, Effect::ArmTimer(TimerKind::RetryBackoff)],
    }
}

/// A tier window expired (or an equivalent failure was counted): escalate per
/// the monitor policy, bounded by the retry cap.
fn recover(mut next: FsmState) -> Step {
    next.negotiation_in_flight = false;
    next.retry_count += 1;
    if next.retry_count > next.retry_cap {
        next.state = SessionState::Failed;
        return Step {
            next,
            effects: vec![
                Effect::CancelAllTimers,
                Effect::CloseSession(TerminationReason::RetryCapExceeded),
            ],
        };
    }

    let mut effects = Vec::new();
    match monitor::on_window_expired(next.tier) {
        RecoveryAction::EscalateRestart(tier) => {
            next.tier = tier;
            next.pending_restart = false;
            next.negotiation_in_flight = true;
            next.state = SessionState::Negotiating(NegotiationRole::Offering);
            effects.push(Effect::EscalateTier(tier));
            effects.push(Effect::BeginOffer { ice_restart: true });
        }
        RecoveryAction::EscalateRebuild(tier) => {
            next.tier = tier;
            next.pending_restart = false;
            next.state = SessionState::Negotiating(NegotiationRole::Offering);
            effects.push(Effect::RebuildLink(tier));
        }
        RecoveryAction::RebuildSameTier => {
            next.state = SessionState::Negotiating(NegotiationRole::Offering);
            effects.push(Effect::RebuildLink(next.tier));
        }
    }
    effects.push(Effect::ArmTimer(TimerKind::TierDeadline));
    Step { next, effects }
}

fn close(mut next: FsmState, reason: TerminationReason, notify_peer: bool) -> Step {
    next.state = match reason {
        TerminationReason::RetryCapExceeded => SessionState::Failed,
        _ => SessionState::Closed,
    };
    let mut effects = Vec::new();
    if notify_peer {
        effects.push(Effect::SendConnectionState(ConnectionPhase::Closed));
    }
    effects.push(Effect::CancelAllTimers);
    effects.push(Effect::CloseSession(reason));
    Step { next, effects }
}

pub fn transition(fsm: &FsmState, event: &SessionEvent) -> Step {
    let mut next = fsm.clone();
    let mut effects = Vec::new();

    // A closed session neither accepts nor emits further signaling.
    if fsm.state.is_terminal() {
        return Step { next, effects };
    }

    match event {
        SessionEvent::Start
        | SessionEvent::Renegotiate
        | SessionEvent::Timer(TimerKind::DeferredOffer)
        | SessionEvent::Timer(TimerKind::RetryBackoff) => {
            // A deferred or backed-off trigger that finds the session already
            // connected has been overtaken: the negotiation it was queued
            // behind completed.
            let overtaken = matches!(
                event,
                SessionEvent::Timer(TimerKind::DeferredOffer)
                    | SessionEvent::Timer(TimerKind::RetryBackoff)
            ) && matches!(fsm.state, SessionState::Connected);
            if overtaken {
                // no-op
            } else if offer_guard_blocks(fsm) {
                // Deferred, not dropped: retried after a short delay.
                effects.push(Effect::ArmTimer(TimerKind::DeferredOffer));
            } else {
                next.negotiation_in_flight = true;
                if !matches!(fsm.state, SessionState::Connected) {
                    next.state = SessionState::Negotiating(NegotiationRole::Offering);
                }
                let ice_restart = fsm.pending_restart;
                next.pending_restart = false;
                effects.push(Effect::BeginOffer { ice_restart });
            }
        }

        SessionEvent::OfferReceived(sdp) => match fsm.signaling {
            // Both sides offered at once; discard our attempt and restart
            // after backoff, against the retry cap.
            SignalingState::HaveLocalOffer => return fail_attempt(next),
            SignalingState::Closed => {}
            _ => {
                next.negotiation_in_flight = true;
                if !matches!(fsm.state, SessionState::Connected) {
                    next.state = SessionState::Negotiating(NegotiationRole::Answering);
                }
                effects.push(Effect::ApplyRemoteOffer(sdp.clone()));
            }
        },

        SessionEvent::AnswerReceived(sdp) => match fsm.signaling {
            SignalingState::HaveLocalOffer => {
                effects.push(Effect::ApplyRemoteAnswer(sdp.clone()));
            }
            // Stale or duplicate answer: explicit no-op.
            SignalingState::Stable | SignalingState::Closed => {}
            // Signaling confusion: both sides tried to offer.
            SignalingState::HaveRemoteOffer => return fail_attempt(next),
        },

        SessionEvent::RemoteCandidate(candidate) => {
            effects.push(Effect::AcceptRemoteCandidate(candidate.clone()));
        }

        SessionEvent::LocalCandidate(candidate) => {
            effects.push(Effect::EnqueueLocalCandidate(candidate.clone()));
        }

        SessionEvent::RetryCandidate(candidate) => {
            effects.push(Effect::RetryRemoteCandidate(candidate.clone()));
        }

        SessionEvent::LinkStateChanged(state) => match state {
            LinkState::Connected | LinkState::Completed => {
                next.state = SessionState::Connected;
                next.negotiation_in_flight = false;
                effects.push(Effect::CancelTimer(TimerKind::TierDeadline));
                effects.push(Effect::CancelTimer(TimerKind::RetryBackoff));
                effects.push(Effect::SendConnectionState(ConnectionPhase::Connected));
            }
            LinkState::Disconnected => {
                if matches!(fsm.state, SessionState::Connected) {
                    next.state = SessionState::Disconnected;
                    // Regressed from connected: re-open the escalation window.
                    effects.push(Effect::ArmTimer(TimerKind::TierDeadline));
                }
            }
            LinkState::Failed => return recover(next),
            LinkState::New | LinkState::Checking | LinkState::Closed => {}
        },

        SessionEvent::Timer(TimerKind::TierDeadline) => {
            if !matches!(fsm.state, SessionState::Connected) {
                return recover(next);
            }
        }

        SessionEvent::HealthCheckFailed | SessionEvent::AttemptFailed => return recover(next),

        SessionEvent::Timer(TimerKind::Heartbeat) => {
            if fsm.state.is_supervised() {
                effects.push(Effect::SendKeepalive);
                effects.push(Effect::ArmTimer(TimerKind::Heartbeat));
            }
        }

        SessionEvent::Timer(TimerKind::StatsTick) => {
            if fsm.state.is_supervised() {
                effects.push(Effect::SampleStats);
                effects.push(Effect::ArmTimer(TimerKind::StatsTick));
            }
        }

        SessionEvent::RemoteConnectionState(phase) => match phase {
            ConnectionPhase::Disconnected | ConnectionPhase::Failed | ConnectionPhase::Closed => {
                // Partner is gone: terminal, no auto-retry, no notification
                // back through a channel they already left.
                return close(next, TerminationReason::RemoteDisconnected, false);
            }
            _ => {}
        },

        SessionEvent::SendRejected { kind, reason } => match reason {
            // Explicit ack, retry later; no session-state change.
            RelayRejection::RateLimited => {}
            RelayRejection::Invalid => {}
            RelayRejection::TargetNotFound | RelayRejection::TargetDisconnected => {
                if matches!(kind, EnvelopeKind::Offer) {
                    return fail_attempt(next);
                }
            }
        },

        SessionEvent::Command(SessionCommand::Mute) => {
            if !fsm.muted {
                next.muted = true;
                effects.push(Effect::MuteOutbound);
            }
        }

        SessionEvent::Command(SessionCommand::Unmute) => {
            if fsm.muted {
                next.muted = false;
                effects.push(Effect::UnmuteOutbound);
            }
        }

        SessionEvent::Command(SessionCommand::Hangup) => {
            return close(next, TerminationReason::Hangup, true);
        }
    }

    Step { next, effects }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm() -> FsmState {
        FsmState::new(15)
    }

    fn offer_payload() -> SdpPayload {
        SdpPayload {
            sdp: "v=0".into(),
            typ: "offer".into(),
        }
    }

    fn answer_payload() -> SdpPayload {
        SdpPayload {
            sdp: "v=0".into(),
            typ: "answer".into(),
        }
    }

    #[test]
    fn start_begins_exactly_one_offer() {
        let step = transition(&fsm(), &SessionEvent::Start);
        assert!(step.next.negotiation_in_flight);
        assert_eq!(
            step.next.state,
            SessionState::Negotiating(NegotiationRole::Offering)
        );
        assert_eq!(step.effects, vec![Effect::BeginOffer { ice_restart: false }]);
    }

    #[test]
    fn second_trigger_is_deferred_while_one_is_in_flight() {
        let mut state = fsm();
        state.negotiation_in_flight = true;
        state.signaling = SignalingState::HaveLocalOffer;
        let step = transition(&state, &SessionEvent::Renegotiate);
        assert_eq!(step.effects, vec![Effect::ArmTimer(TimerKind::DeferredOffer)]);
        assert!(step.next.negotiation_in_flight);
    }

    #[test]
    fn deferred_trigger_fires_once_the_flight_clears() {
        let mut state = fsm();
        state.negotiation_in_flight = false;
        state.signaling = SignalingState::Stable;
        let step = transition(&state, &SessionEvent::Timer(TimerKind::DeferredOffer));
        assert_eq!(step.effects, vec![Effect::BeginOffer { ice_restart: false }]);
    }

    #[test]
    fn deferred_trigger_is_dropped_once_connected() {
        let mut state = fsm();
        state.state = SessionState::Connected;
        let step = transition(&state, &SessionEvent::Timer(TimerKind::DeferredOffer));
        assert!(step.effects.is_empty());

        // An explicit renegotiation request while connected still proceeds
        // (unmute over a brand-new sender needs it) and never leaves
        // `connected`.
        let step = transition(&state, &SessionEvent::Renegotiate);
        assert_eq!(step.effects, vec![Effect::BeginOffer { ice_restart: false }]);
        assert_eq!(step.next.state, SessionState::Connected);
    }

    #[test]
    fn answer_applies_only_in_have_local_offer() {
        let mut state = fsm();
        state.signaling = SignalingState::HaveLocalOffer;
        state.negotiation_in_flight = true;
        let step = transition(&state, &SessionEvent::AnswerReceived(answer_payload()));
        assert_eq!(
            step.effects,
            vec![Effect::ApplyRemoteAnswer(answer_payload())]
        );
    }

    #[test]
    fn stale_answer_in_stable_is_a_no_op() {
        let mut state = fsm();
        state.signaling = SignalingState::Stable;
        let step = transition(&state, &SessionEvent::AnswerReceived(answer_payload()));
        assert!(step.effects.is_empty());
        assert_eq!(step.next.retry_count, 0);
    }

    #[test]
    fn answer_during_have_remote_offer_restarts_and_counts() {
        let mut state = fsm();
        state.signaling = SignalingState::HaveRemoteOffer;
        state.negotiation_in_flight = true;
        let step = transition(&state, &SessionEvent::AnswerReceived(answer_payload()));
        assert_eq!(step.next.retry_count, 1);
        assert!(!step.next.negotiation_in_flight);
        assert!(step.effects.contains(&Effect::ResetLink));
        assert!(step
            .effects
            .contains(&Effect::ArmTimer(TimerKind::RetryBackoff)));
    }

    #[test]
    fn offer_glare_discards_and_backs_off() {
        let mut state = fsm();
        state.signaling = SignalingState::HaveLocalOffer;
        state.negotiation_in_flight = true;
        let step = transition(&state, &SessionEvent::OfferReceived(offer_payload()));
        assert_eq!(step.next.retry_count, 1);
        assert!(step.effects.contains(&Effect::ResetLink));
    }

    #[test]
    fn inbound_offer_is_answered() {
        let step = transition(&fsm(), &SessionEvent::OfferReceived(offer_payload()));
        assert_eq!(
            step.next.state,
            SessionState::Negotiating(NegotiationRole::Answering)
        );
        assert_eq!(step.effects, vec![Effect::ApplyRemoteOffer(offer_payload())]);
    }

    #[test]
    fn tier_deadline_escalates_standard_to_fast_with_restart() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        let step = transition(&state, &SessionEvent::Timer(TimerKind::TierDeadline));
        assert_eq!(step.next.tier, IceTier::Fast);
        assert!(step.effects.contains(&Effect::EscalateTier(IceTier::Fast)));
        assert!(step
            .effects
            .contains(&Effect::BeginOffer { ice_restart: true }));
        assert!(step
            .effects
            .contains(&Effect::ArmTimer(TimerKind::TierDeadline)));
    }

    #[test]
    fn tier_deadline_escalates_fast_to_relay_only_with_rebuild() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        state.tier = IceTier::Fast;
        let step = transition(&state, &SessionEvent::Timer(TimerKind::TierDeadline));
        assert_eq!(step.next.tier, IceTier::RelayOnly);
        assert!(step
            .effects
            .contains(&Effect::RebuildLink(IceTier::RelayOnly)));
        assert!(!step
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::BeginOffer { .. })));
    }

    #[test]
    fn tiers_never_skip_from_standard_to_relay_only() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        let step = transition(&state, &SessionEvent::Timer(TimerKind::TierDeadline));
        assert_eq!(step.next.tier, IceTier::Fast);
        let step = transition(&step.next, &SessionEvent::Timer(TimerKind::TierDeadline));
        assert_eq!(step.next.tier, IceTier::RelayOnly);
    }

    #[test]
    fn deadline_while_connected_is_ignored() {
        let mut state = fsm();
        state.state = SessionState::Connected;
        let step = transition(&state, &SessionEvent::Timer(TimerKind::TierDeadline));
        assert!(step.effects.is_empty());
        assert_eq!(step.next.retry_count, 0);
    }

    #[test]
    fn retry_cap_is_terminal() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        state.retry_count = 15;
        let step = transition(&state, &SessionEvent::Timer(TimerKind::TierDeadline));
        assert_eq!(step.next.state, SessionState::Failed);
        assert_eq!(step.next.retry_count, 16);
        assert!(step
            .effects
            .contains(&Effect::CloseSession(TerminationReason::RetryCapExceeded)));

        // And the terminal state accepts nothing further.
        let after = transition(&step.next, &SessionEvent::Start);
        assert!(after.effects.is_empty());
    }

    #[test]
    fn connect_cancels_the_deadline_and_notifies() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        state.negotiation_in_flight = true;
        let step = transition(
            &state,
            &SessionEvent::LinkStateChanged(LinkState::Connected),
        );
        assert_eq!(step.next.state, SessionState::Connected);
        assert!(!step.next.negotiation_in_flight);
        assert!(step
            .effects
            .contains(&Effect::CancelTimer(TimerKind::TierDeadline)));
        assert!(step
            .effects
            .contains(&Effect::SendConnectionState(ConnectionPhase::Connected)));
    }

    #[test]
    fn mute_and_unmute_never_leave_connected() {
        let mut state = fsm();
        state.state = SessionState::Connected;
        let step = transition(&state, &SessionEvent::Command(SessionCommand::Mute));
        assert_eq!(step.next.state, SessionState::Connected);
        assert!(step.next.muted);
        assert_eq!(step.effects, vec![Effect::MuteOutbound]);

        let step = transition(&step.next, &SessionEvent::Command(SessionCommand::Unmute));
        assert_eq!(step.next.state, SessionState::Connected);
        assert!(!step.next.muted);
        assert_eq!(step.effects, vec![Effect::UnmuteOutbound]);
    }

    #[test]
    fn remote_disconnect_is_terminal_without_retry() {
        let mut state = fsm();
        state.state = SessionState::Connected;
        let step = transition(
            &state,
            &SessionEvent::RemoteConnectionState(ConnectionPhase::Disconnected),
        );
        assert_eq!(step.next.state, SessionState::Closed);
        assert!(step
            .effects
            .contains(&Effect::CloseSession(TerminationReason::RemoteDisconnected)));
        assert!(!step
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::SendConnectionState(_))));
    }

    #[test]
    fn hangup_notifies_the_peer_then_closes() {
        let mut state = fsm();
        state.state = SessionState::Connected;
        let step = transition(&state, &SessionEvent::Command(SessionCommand::Hangup));
        assert_eq!(step.next.state, SessionState::Closed);
        assert_eq!(
            step.effects,
            vec![
                Effect::SendConnectionState(ConnectionPhase::Closed),
                Effect::CancelAllTimers,
                Effect::CloseSession(TerminationReason::Hangup),
            ]
        );
    }

    #[test]
    fn offer_send_rejection_counts_as_a_failed_attempt() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        state.negotiation_in_flight = true;
        let step = transition(
            &state,
            &SessionEvent::SendRejected {
                kind: EnvelopeKind::Offer,
                reason: RelayRejection::TargetNotFound,
            },
        );
        assert_eq!(step.next.retry_count, 1);
    }

    #[test]
    fn rate_limited_sends_change_nothing() {
        let mut state = fsm();
        state.state = SessionState::Negotiating(NegotiationRole::Offering);
        let step = transition(
            &state,
            &SessionEvent::SendRejected {
                kind: EnvelopeKind::IceCandidate,
                reason: RelayRejection::RateLimited,
            },
        );
        assert!(step.effects.is_empty());
        assert_eq!(step.next.retry_count, 0);
    }

    #[test]
    fn heartbeats_rearm_only_while_supervised() {
        let mut state = fsm();
        state.state = SessionState::Connected;
        let step = transition(&state, &SessionEvent::Timer(TimerKind::Heartbeat));
        assert_eq!(
            step.effects,
            vec![Effect::SendKeepalive, Effect::ArmTimer(TimerKind::Heartbeat)]
        );

        let mut idle = fsm();
        idle.state = SessionState::Idle;
        let step = transition(&idle, &SessionEvent::Timer(TimerKind::Heartbeat));
        assert!(step.effects.is_empty());
    }
}
