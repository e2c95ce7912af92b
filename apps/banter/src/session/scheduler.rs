//! One cooperative timer scheduler per session. Every timer a session ever
//! arms lives here and is cancelled atomically on close, so nothing can fire
//! against a disposed session.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{SessionEvent, TimerKind};

pub struct SessionScheduler {
    tx: mpsc::UnboundedSender<SessionEvent>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    oneshots: Vec<JoinHandle<()>>,
}

impl SessionScheduler {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            tx,
            timers: HashMap::new(),
            oneshots: Vec::new(),
        }
    }

    /// Arm (or re-arm) a keyed timer; an existing timer of the same kind is
    /// replaced.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        if let Some(handle) = self.timers.remove(&kind) {
            handle.abort();
        }
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionEvent::Timer(kind));
        });
        self.timers.insert(kind, handle);
    }

    /// Fire an arbitrary event after a delay (candidate retries carry their
    /// payload this way).
    pub fn arm_oneshot(&mut self, delay: Duration, event: SessionEvent) {
        self.oneshots.retain(|handle| !handle.is_finished());
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        self.oneshots.push(handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.timers.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        for handle in self.oneshots.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn armed_timers_fire_into_the_mailbox() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = SessionScheduler::new(tx);
        scheduler.arm(TimerKind::TierDeadline, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        match rx.try_recv() {
            Ok(SessionEvent::Timer(TimerKind::TierDeadline)) => {}
            other => panic!("expected tier deadline, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = SessionScheduler::new(tx);
        scheduler.arm(TimerKind::Heartbeat, Duration::from_secs(1));
        scheduler.arm(TimerKind::Heartbeat, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "replaced timer must not fire");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_silences_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = SessionScheduler::new(tx);
        scheduler.arm(TimerKind::TierDeadline, Duration::from_secs(1));
        scheduler.arm(TimerKind::Heartbeat, Duration::from_secs(1));
        scheduler.arm_oneshot(Duration::from_secs(1), SessionEvent::AttemptFailed);
        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
