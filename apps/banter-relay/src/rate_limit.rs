use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use banter_proto::{EnvelopeKind, UserId};

/// One sliding window of accepted timestamps.
#[derive(Debug)]
struct SlidingWindow {
    capacity: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            hits: VecDeque::new(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.capacity {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

/// Per-(user, kind) sliding-window rate limiter. Only offers and ICE
/// candidates are capped; answers and connection-state notifications must
/// always get through so sessions can settle.
pub struct RateLimiter {
    offer_limit: usize,
    candidate_limit: usize,
    window: Duration,
    windows: DashMap<(UserId, EnvelopeKind), SlidingWindow>,
}

impl RateLimiter {
    pub fn new(offer_limit: usize, candidate_limit: usize, window: Duration) -> Self {
        Self {
            offer_limit,
            candidate_limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// Returns `true` if the envelope is within budget. Uncapped kinds always
    /// pass without touching any window state.
    pub fn check(&self, user: &UserId, kind: EnvelopeKind, now: Instant) -> bool {
        let capacity = match kind {
            EnvelopeKind::Offer => self.offer_limit,
            EnvelopeKind::IceCandidate => self.candidate_limit,
            EnvelopeKind::Answer | EnvelopeKind::ConnectionState => return true,
        };
        let mut entry = self
            .windows
            .entry((user.clone(), kind))
            .or_insert_with(|| SlidingWindow::new(capacity, self.window));
        entry.try_acquire(now)
    }

    /// Drop all window state for a disconnected user.
    pub fn purge_user(&self, user: &UserId) {
        self.windows.retain(|(owner, _), _| owner != user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(2, 3, Duration::from_secs(90))
    }

    #[test]
    fn offers_are_capped_per_window() {
        let limiter = limiter();
        let alice = UserId::from("alice");
        let now = Instant::now();
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
        assert!(!limiter.check(&alice, EnvelopeKind::Offer, now));
    }

    #[test]
    fn window_slides() {
        let limiter = limiter();
        let alice = UserId::from("alice");
        let start = Instant::now();
        assert!(limiter.check(&alice, EnvelopeKind::Offer, start));
        assert!(limiter.check(&alice, EnvelopeKind::Offer, start));
        assert!(!limiter.check(&alice, EnvelopeKind::Offer, start));
        let later = start + Duration::from_secs(91);
        assert!(limiter.check(&alice, EnvelopeKind::Offer, later));
    }

    #[test]
    fn answers_and_state_are_never_limited() {
        let limiter = RateLimiter::new(0, 0, Duration::from_secs(90));
        let alice = UserId::from("alice");
        let now = Instant::now();
        assert!(limiter.check(&alice, EnvelopeKind::Answer, now));
        assert!(limiter.check(&alice, EnvelopeKind::ConnectionState, now));
        assert!(!limiter.check(&alice, EnvelopeKind::Offer, now));
    }

    #[test]
    fn users_do_not_share_budgets() {
        let limiter = limiter();
        let now = Instant::now();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
        assert!(!limiter.check(&alice, EnvelopeKind::Offer, now));
        assert!(limiter.check(&bob, EnvelopeKind::Offer, now));
    }

    #[test]
    fn purge_resets_budget() {
        let limiter = limiter();
        let alice = UserId::from("alice");
        let now = Instant::now();
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
        limiter.purge_user(&alice);
        assert!(limiter.check(&alice, EnvelopeKind::Offer, now));
    }
}
