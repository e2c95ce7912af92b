use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use banter_proto::UserId;

/// One outstanding offer, keyed by the ordered (offerer, answerer) pair.
/// Diagnostic bookkeeping only: a pending record never blocks delivery, it is
/// used to spot signaling confusion and to synthesize disconnect
/// notifications.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub offered_at: Instant,
    pub offered_at_utc: DateTime<Utc>,
    /// How many offers have been routed for this pair while unanswered.
    pub offer_count: u32,
}

/// Serializable view for the diagnostic HTTP endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub from: UserId,
    pub to: UserId,
    pub offered_at: DateTime<Utc>,
    pub offer_count: u32,
}

#[derive(Default)]
pub struct PendingConnections {
    records: DashMap<(UserId, UserId), PendingRecord>,
}

impl PendingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an offer from `from` to `to`. Repeated offers for the same pair
    /// bump the counter instead of resetting the original timestamp; a
    /// climbing count on one record is the signaling-confusion signal.
    pub fn record_offer(&self, from: &UserId, to: &UserId) -> u32 {
        let mut entry = self
            .records
            .entry((from.clone(), to.clone()))
            .or_insert_with(|| PendingRecord {
                offered_at: Instant::now(),
                offered_at_utc: Utc::now(),
                offer_count: 0,
            });
        entry.offer_count += 1;
        entry.offer_count
    }

    /// An answer from `answerer` settles the record opened by `offerer`.
    pub fn resolve_answer(&self, offerer: &UserId, answerer: &UserId) {
        self.records
            .remove(&(offerer.clone(), answerer.clone()));
    }

    /// A connected/completed notification settles the pair in both
    /// orientations; either side may report first.
    pub fn resolve_connected(&self, a: &UserId, b: &UserId) {
        self.records.remove(&(a.clone(), b.clone()));
        self.records.remove(&(b.clone(), a.clone()));
    }

    /// Every peer that still has an open record against `user`, in either
    /// orientation. These are the peers that must learn about a disconnect.
    pub fn peers_of(&self, user: &UserId) -> Vec<UserId> {
        let mut peers: Vec<UserId> = self
            .records
            .iter()
            .filter_map(|entry| {
                let (from, to) = entry.key();
                if from == user {
                    Some(to.clone())
                } else if to == user {
                    Some(from.clone())
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn purge_user(&self, user: &UserId) {
        self.records
            .retain(|(from, to), _| from != user && to != user);
    }

    pub fn snapshot(&self) -> Vec<PendingView> {
        self.records
            .iter()
            .map(|entry| {
                let (from, to) = entry.key();
                PendingView {
                    from: from.clone(),
                    to: to.clone(),
                    offered_at: entry.offered_at_utc,
                    offer_count: entry.offer_count,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
