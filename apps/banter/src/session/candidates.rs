//! Ordering gate for trickled ICE candidates.
//!
//! Local candidates wait until the partner is known and the local description
//! has been applied, then flush strict FIFO, each exactly once. Remote
//! candidates wait until both descriptions are set. Nothing leaves this
//! buffer without being flushed or explicitly logged.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::warn;

use crate::link::CandidateInit;

#[derive(Debug, Clone)]
pub struct QueuedCandidate {
    pub candidate: CandidateInit,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct IceCandidateBuffer {
    partner_known: bool,
    local_description_set: bool,
    remote_description_set: bool,
    local_queue: VecDeque<QueuedCandidate>,
    remote_queue: VecDeque<QueuedCandidate>,
    flushed_local: u64,
    applied_remote: u64,
    failed_remote: u64,
}

impl IceCandidateBuffer {
    pub fn new(partner_known: bool) -> Self {
        Self {
            partner_known,
            local_description_set: false,
            remote_description_set: false,
            local_queue: VecDeque::new(),
            remote_queue: VecDeque::new(),
            flushed_local: 0,
            applied_remote: 0,
            failed_remote: 0,
        }
    }

    pub fn set_partner_known(&mut self) {
        self.partner_known = true;
    }

    fn local_ready(&self) -> bool {
        self.partner_known && self.local_description_set
    }

    fn remote_ready(&self) -> bool {
        self.local_description_set && self.remote_description_set
    }

    /// Mark the local description applied and return every local candidate
    /// that becomes sendable, in enqueue order.
    pub fn mark_local_description(&mut self) -> Vec<CandidateInit> {
        self.local_description_set = true;
        self.drain_local()
    }

    /// Mark the remote description applied and return every buffered remote
    /// candidate that becomes applicable.
    pub fn mark_remote_description(&mut self) -> Vec<CandidateInit> {
        self.remote_description_set = true;
        self.drain_remote()
    }

    /// Queue or pass through one locally gathered candidate. `Some` means
    /// send it now; `None` means it is buffered.
    pub fn push_local(&mut self, candidate: CandidateInit) -> Option<CandidateInit> {
        if self.local_ready() && self.local_queue.is_empty() {
            self.flushed_local += 1;
            return Some(candidate);
        }
        self.local_queue.push_back(QueuedCandidate {
            candidate,
            enqueued_at: Instant::now(),
        });
        None
    }

    /// Queue or pass through one remote candidate.
    pub fn push_remote(&mut self, candidate: CandidateInit) -> Option<CandidateInit> {
        if self.remote_ready() && self.remote_queue.is_empty() {
            self.applied_remote += 1;
            return Some(candidate);
        }
        self.remote_queue.push_back(QueuedCandidate {
            candidate,
            enqueued_at: Instant::now(),
        });
        None
    }

    fn drain_local(&mut self) -> Vec<CandidateInit> {
        if !self.local_ready() {
            return Vec::new();
        }
        let drained: Vec<_> = self
            .local_queue
            .drain(..)
            .map(|entry| entry.candidate)
            .collect();
        self.flushed_local += drained.len() as u64;
        drained
    }

    fn drain_remote(&mut self) -> Vec<CandidateInit> {
        if !self.remote_ready() {
            return Vec::new();
        }
        let drained: Vec<_> = self
            .remote_queue
            .drain(..)
            .map(|entry| entry.candidate)
            .collect();
        self.applied_remote += drained.len() as u64;
        drained
    }

    /// Record that a remote candidate exhausted its single retry. Non-fatal
    /// to the session, but it must leave a trace.
    pub fn record_terminal_failure(&mut self, candidate: &CandidateInit) {
        self.failed_remote += 1;
        warn!(
            candidate = %candidate.candidate,
            "candidate failed to apply after retry; dropping"
        );
    }

    /// Forget description progress after a link rebuild. Queued candidates
    /// belong to the torn-down session and are logged out, never silently
    /// discarded.
    pub fn reset_for_rebuild(&mut self) {
        self.local_description_set = false;
        self.remote_description_set = false;
        for entry in self.local_queue.drain(..) {
            warn!(
                candidate = %entry.candidate.candidate,
                "dropping stale local candidate on rebuild"
            );
        }
        for entry in self.remote_queue.drain(..) {
            warn!(
                candidate = %entry.candidate.candidate,
                "dropping stale remote candidate on rebuild"
            );
        }
    }

    pub fn flushed_local(&self) -> u64 {
        self.flushed_local
    }

    pub fn applied_remote(&self) -> u64 {
        self.applied_remote
    }

    pub fn failed_remote(&self) -> u64 {
        self.failed_remote
    }
}
