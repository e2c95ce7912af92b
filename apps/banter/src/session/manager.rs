//! Explicit owner of every live [`PeerSession`]: a keyed collection with
//! create/dispose lifecycle, replacing any notion of ambient "current call"
//! state. One session per remote user; sessions run as independent actors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use banter_proto::{
    ClientMessage, EnvelopeKind, RelayRejection, ServerMessage, SignalPayload, UserId,
};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ice::IceConfigProvider;
use crate::link::LinkFactory;
use crate::media::MediaSource;
use crate::signaling::SignalingTransport;

use super::actor::{PeerSessionActor, SessionContext, SessionOutbound};
use super::{CallEvent, NegotiationRole, SessionCommand, SessionEvent};

struct SessionEntry {
    tx: mpsc::UnboundedSender<SessionEvent>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    local: UserId,
    signaling: Arc<dyn SignalingTransport>,
    link_factory: Arc<dyn LinkFactory>,
    media: Arc<dyn MediaSource>,
    ice: Arc<dyn IceConfigProvider>,
    config: EngineConfig,
    sessions: DashMap<UserId, SessionEntry>,
    events: broadcast::Sender<CallEvent>,
    seq: AtomicU64,
    /// seq -> (remote, kind) so a rejected ack can be routed back to the
    /// session that sent the envelope.
    in_flight_sends: DashMap<u64, (UserId, EnvelopeKind)>,
}

#[async_trait]
impl SessionOutbound for ManagerInner {
    async fn send_signal(&self, to: &UserId, signal: SignalPayload) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight_sends
            .insert(seq, (to.clone(), signal.kind()));
        let message = ClientMessage::Envelope {
            seq,
            to: to.clone(),
            signal,
        };
        if let Err(err) = self.signaling.send(message).await {
            warn!(to = %to, error = %err, "failed to send envelope");
            self.in_flight_sends.remove(&seq);
        }
    }

    fn session_finished(&self, remote: &UserId) {
        // Only remove the entry that actually finished; a replacement session
        // under the same key has a live mailbox.
        let finished = self
            .sessions
            .get(remote)
            .map(|entry| entry.tx.is_closed())
            .unwrap_or(false);
        if finished && self.sessions.remove(remote).is_some() {
            debug!(remote = %remote, "session deregistered");
        }
    }
}

/// Public handle onto the engine. Cloneable; all clones share one signaling
/// channel and one session registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        local: UserId,
        signaling: Arc<dyn SignalingTransport>,
        link_factory: Arc<dyn LinkFactory>,
        media: Arc<dyn MediaSource>,
        ice: Arc<dyn IceConfigProvider>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                local,
                signaling,
                link_factory,
                media,
                ice,
                config,
                sessions: DashMap::new(),
                events,
                seq: AtomicU64::new(0),
                in_flight_sends: DashMap::new(),
            }),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Matchmaking produced a partner: create the session and start offering.
    /// A second call for the same partner requests renegotiation on the
    /// existing session instead of creating a duplicate.
    pub fn place_call(&self, remote: UserId) -> Result<(), EngineError> {
        if remote == self.inner.local {
            return Err(EngineError::Validation("cannot call yourself".into()));
        }
        if let Some(entry) = self.inner.sessions.get(&remote) {
            debug!(remote = %remote, "session exists; requesting renegotiation");
            entry
                .tx
                .send(SessionEvent::Renegotiate)
                .map_err(|_| EngineError::Fatal("session mailbox closed".into()))?;
            return Ok(());
        }
        self.spawn_session(remote, NegotiationRole::Offering, None);
        Ok(())
    }

    pub fn hangup(&self, remote: &UserId) -> Result<(), EngineError> {
        self.command(remote, SessionCommand::Hangup)
    }

    pub fn mute(&self, remote: &UserId) -> Result<(), EngineError> {
        self.command(remote, SessionCommand::Mute)
    }

    pub fn unmute(&self, remote: &UserId) -> Result<(), EngineError> {
        self.command(remote, SessionCommand::Unmute)
    }

    fn command(&self, remote: &UserId, command: SessionCommand) -> Result<(), EngineError> {
        let entry = self
            .inner
            .sessions
            .get(remote)
            .ok_or_else(|| EngineError::Validation(format!("no active session with {remote}")))?;
        entry
            .tx
            .send(SessionEvent::Command(command))
            .map_err(|_| EngineError::Fatal("session mailbox closed".into()))
    }

    /// Drive inbound signaling until the relay channel closes. Run this on a
    /// dedicated task.
    pub async fn run(&self) {
        while let Some(message) = self.inner.signaling.recv().await {
            match message {
                ServerMessage::Envelope { from, signal, .. } => {
                    self.dispatch_envelope(from, signal);
                }
                ServerMessage::Ack {
                    seq,
                    accepted,
                    reason,
                } => self.dispatch_ack(seq, accepted, reason),
                ServerMessage::Pong => {}
                ServerMessage::Error { message } => {
                    warn!(relay_error = %message, "relay reported an error");
                }
            }
        }
        info!("signaling channel closed; inbound routing stopped");
    }

    fn dispatch_envelope(&self, from: UserId, signal: SignalPayload) {
        let event = match signal {
            SignalPayload::Offer(sdp) => SessionEvent::OfferReceived(sdp),
            SignalPayload::Answer(sdp) => SessionEvent::AnswerReceived(sdp),
            SignalPayload::IceCandidate(candidate) => SessionEvent::RemoteCandidate(candidate),
            SignalPayload::ConnectionState(state) => {
                SessionEvent::RemoteConnectionState(state.phase)
            }
        };

        if let Some(entry) = self.inner.sessions.get(&from) {
            let _ = entry.tx.send(event);
            return;
        }

        // An unsolicited inbound offer is the other legitimate trigger for
        // session creation; anything else without a session is noise.
        match event {
            SessionEvent::OfferReceived(_) => {
                info!(remote = %from, "inbound offer; creating answering session");
                self.spawn_session(from, NegotiationRole::Answering, Some(event));
            }
            other => {
                debug!(remote = %from, event = ?other, "dropping signal for unknown session");
            }
        }
    }

    fn dispatch_ack(&self, seq: u64, accepted: bool, reason: Option<RelayRejection>) {
        let Some((_, (remote, kind))) = self.inner.in_flight_sends.remove(&seq) else {
            return;
        };
        if accepted {
            return;
        }
        let reason = reason.unwrap_or(RelayRejection::Invalid);
        debug!(remote = %remote, ?kind, ?reason, "relay rejected envelope");
        if let Some(entry) = self.inner.sessions.get(&remote) {
            let _ = entry.tx.send(SessionEvent::SendRejected { kind, reason });
        }
    }

    fn spawn_session(
        &self,
        remote: UserId,
        role: NegotiationRole,
        first_event: Option<SessionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local: self.inner.local.clone(),
            remote: remote.clone(),
            config: self.inner.config.clone(),
            outbound: self.inner.clone() as Arc<dyn SessionOutbound>,
            link_factory: self.inner.link_factory.clone(),
            media: self.inner.media.clone(),
            ice: self.inner.ice.clone(),
            events: self.inner.events.clone(),
        };
        if let Some(event) = first_event {
            let _ = tx.send(event);
        }
        let actor = PeerSessionActor::new(ctx, rx, tx.clone());
        let task = tokio::spawn(actor.run(role));
        self.inner
            .sessions
            .insert(remote, SessionEntry { tx, task });
    }

    /// Hang up everything and stop. Idempotent.
    pub async fn shutdown(&self) {
        let remotes: Vec<UserId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for remote in remotes {
            let _ = self.hangup(&remote);
        }
        self.inner.signaling.close().await;
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.task.abort();
        }
    }
}
