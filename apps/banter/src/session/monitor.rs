//! Health supervision policy: tier escalation decisions and stats-driven
//! repair. Pure decision logic; the session actor executes the outcome.

use crate::ice::IceTier;
use crate::link::StatsSnapshot;

/// What to do when a tier window expires without a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Move to the tier and restart ICE on the live session.
    EscalateRestart(IceTier),
    /// Move to the tier and rebuild the session from scratch; used when the
    /// transport policy changes, which cannot happen on a live session.
    EscalateRebuild(IceTier),
    /// Already at the last tier: rebuild again and keep burning the retry
    /// budget until the cap ends it.
    RebuildSameTier,
}

/// Escalation is strictly increasing and never skips a tier.
pub fn on_window_expired(tier: IceTier) -> RecoveryAction {
    match tier {
        IceTier::Standard => RecoveryAction::EscalateRestart(IceTier::Fast),
        IceTier::Fast => RecoveryAction::EscalateRebuild(IceTier::RelayOnly),
        IceTier::RelayOnly => RecoveryAction::RebuildSameTier,
    }
}

/// Result of comparing two consecutive stat samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub audio_flowing: bool,
    pub pair_succeeded: bool,
}

impl HealthCheck {
    pub fn healthy(self) -> bool {
        self.audio_flowing && self.pair_succeeded
    }
}

/// Evaluate the current sample against the previous one. The first sample of
/// a window is given the benefit of the doubt on audio flow.
pub fn evaluate(previous: Option<&StatsSnapshot>, current: &StatsSnapshot) -> HealthCheck {
    let audio_flowing = match previous {
        Some(previous) => current.audio_bytes_sent > previous.audio_bytes_sent,
        None => true,
    };
    HealthCheck {
        audio_flowing,
        pair_succeeded: current.selected_pair_succeeded,
    }
}

/// Tracks repair state across stat samples: one non-destructive repair is
/// attempted before an unhealthy stretch counts against the escalation
/// policy.
#[derive(Debug, Default)]
pub struct HealthTracker {
    previous: Option<StatsSnapshot>,
    repair_attempted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Unhealthy for the first time in this stretch: try a repair.
    AttemptRepair,
    /// Still unhealthy after a repair: count it as a failure.
    CountFailure,
}

impl HealthTracker {
    pub fn observe(&mut self, sample: StatsSnapshot) -> HealthVerdict {
        let check = evaluate(self.previous.as_ref(), &sample);
        self.previous = Some(sample);
        if check.healthy() {
            self.repair_attempted = false;
            return HealthVerdict::Healthy;
        }
        if self.repair_attempted {
            self.repair_attempted = false;
            HealthVerdict::CountFailure
        } else {
            self.repair_attempted = true;
            HealthVerdict::AttemptRepair
        }
    }

    /// Reset after a rebuild so the fresh link starts a clean stretch.
    pub fn reset(&mut self) {
        self.previous = None;
        self.repair_attempted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_is_strictly_increasing_and_never_skips() {
        assert_eq!(
            on_window_expired(IceTier::Standard),
            RecoveryAction::EscalateRestart(IceTier::Fast)
        );
        assert_eq!(
            on_window_expired(IceTier::Fast),
            RecoveryAction::EscalateRebuild(IceTier::RelayOnly)
        );
        assert_eq!(
            on_window_expired(IceTier::RelayOnly),
            RecoveryAction::RebuildSameTier
        );
    }

    #[test]
    fn relay_only_requires_rebuild_not_restart() {
        match on_window_expired(IceTier::Fast) {
            RecoveryAction::EscalateRebuild(tier) => assert_eq!(tier, IceTier::RelayOnly),
            other => panic!("expected rebuild, got {other:?}"),
        }
    }

    #[test]
    fn first_sample_is_trusted_on_flow() {
        let check = evaluate(
            None,
            &StatsSnapshot {
                audio_bytes_sent: 0,
                selected_pair_succeeded: true,
            },
        );
        assert!(check.healthy());
    }

    #[test]
    fn stalled_audio_is_unhealthy() {
        let previous = StatsSnapshot {
            audio_bytes_sent: 100,
            selected_pair_succeeded: true,
        };
        let check = evaluate(
            Some(&previous),
            &StatsSnapshot {
                audio_bytes_sent: 100,
                selected_pair_succeeded: true,
            },
        );
        assert!(!check.audio_flowing);
        assert!(!check.healthy());
    }

    #[test]
    fn tracker_repairs_once_before_counting() {
        let mut tracker = HealthTracker::default();
        let stalled = StatsSnapshot {
            audio_bytes_sent: 50,
            selected_pair_succeeded: false,
        };
        assert_eq!(tracker.observe(stalled), HealthVerdict::AttemptRepair);
        assert_eq!(tracker.observe(stalled), HealthVerdict::CountFailure);
        // A healthy sample clears the stretch.
        let healthy = StatsSnapshot {
            audio_bytes_sent: 150,
            selected_pair_succeeded: true,
        };
        assert_eq!(tracker.observe(healthy), HealthVerdict::Healthy);
        assert_eq!(tracker.observe(stalled), HealthVerdict::AttemptRepair);
    }
}
