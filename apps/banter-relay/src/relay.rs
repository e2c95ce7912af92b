use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::increment_counter;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use banter_proto::{
    legacy, ClientMessage, ConnectionPhase, ConnectionStatePayload, EnvelopeKind, RelayRejection,
    ServerMessage, SignalPayload, UserId,
};

use crate::config::Config;
use crate::pending::PendingConnections;
use crate::rate_limit::RateLimiter;

/// The live channel for one connected user. A reconnect replaces the channel
/// under the same logical user id; the epoch distinguishes the old socket's
/// teardown from the new socket's state.
#[derive(Clone)]
struct UserChannel {
    epoch: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Arc<RwLock<Instant>>,
}

/// Shared router state: one entry per connected user, plus the rate-limit,
/// dedup and pending-offer bookkeeping.
#[derive(Clone)]
pub struct RelayState {
    channels: Arc<DashMap<UserId, UserChannel>>,
    limiter: Arc<RateLimiter>,
    /// Last-seen instant and payload fingerprint per (from, to, kind).
    dedup: Arc<DashMap<(UserId, UserId, EnvelopeKind), (Instant, u64)>>,
    pending: Arc<PendingConnections>,
    config: Arc<Config>,
    epoch_counter: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        let state = Self {
            channels: Arc::new(DashMap::new()),
            limiter: Arc::new(RateLimiter::new(
                config.offer_limit,
                config.candidate_limit,
                config.rate_window,
            )),
            dedup: Arc::new(DashMap::new()),
            pending: Arc::new(PendingConnections::new()),
            config: Arc::new(config),
            epoch_counter: Arc::new(AtomicU64::new(0)),
        };

        let sweeper = state.clone();
        tokio::spawn(async move {
            sweeper.sweep_idle_channels().await;
        });

        state
    }

    pub fn pending(&self) -> &PendingConnections {
        &self.pending
    }

    pub fn connected_users(&self) -> usize {
        self.channels.len()
    }

    /// Periodically drop channels that have been silent past the idle
    /// timeout, with the same peer notification a hard disconnect gets.
    async fn sweep_idle_channels(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;

            // Collect the heartbeat locks first; awaiting while holding a
            // DashMap guard can deadlock against the socket tasks.
            let candidates: Vec<_> = self
                .channels
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        entry.value().epoch,
                        entry.value().last_seen.clone(),
                    )
                })
                .collect();

            let mut stale = Vec::new();
            for (user, epoch, last_seen) in candidates {
                if last_seen.read().await.elapsed() > self.config.channel_idle_timeout {
                    stale.push((user, epoch));
                }
            }

            for (user, epoch) in stale {
                info!(user = %user, "sweeping idle signaling channel");
                self.drop_user(&user, epoch);
            }
        }
    }

    fn register(&self, user: &UserId, tx: mpsc::UnboundedSender<ServerMessage>) -> u64 {
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let replaced = self.channels.insert(
            user.clone(),
            UserChannel {
                epoch,
                tx,
                last_seen: Arc::new(RwLock::new(Instant::now())),
            },
        );
        if replaced.is_some() {
            debug!(user = %user, "replacing live channel after reconnect");
        }
        epoch
    }

    /// Tear down a user's channel if it still belongs to `epoch`, then notify
    /// every peer holding an open offer against them and purge per-user state.
    fn drop_user(&self, user: &UserId, epoch: u64) {
        let owned = self
            .channels
            .get(user)
            .map(|channel| channel.epoch == epoch)
            .unwrap_or(false);
        if !owned {
            // A newer socket took over the id; nothing to clean up.
            return;
        }
        self.channels.remove(user);

        for peer in self.pending.peers_of(user) {
            let synthesized = ServerMessage::Envelope {
                from: user.clone(),
                sent_at: Utc::now(),
                signal: SignalPayload::ConnectionState(ConnectionStatePayload {
                    phase: ConnectionPhase::Disconnected,
                }),
            };
            if let Some(channel) = self.channels.get(&peer) {
                if channel.tx.send(synthesized).is_ok() {
                    debug!(user = %user, peer = %peer, "synthesized disconnect notification");
                }
            }
        }

        self.limiter.purge_user(user);
        self.pending.purge_user(user);
        self.dedup
            .retain(|(from, to, _), _| from != user && to != user);
    }

    /// Returns `true` when this envelope repeats an identical send inside the
    /// dedup window: same (from, to, kind) and the same payload. The
    /// duplicate is acked but not delivered. Last-seen is only committed
    /// after a successful hand-off so a rejected send does not shadow its own
    /// retry.
    fn is_duplicate(
        &self,
        from: &UserId,
        to: &UserId,
        kind: EnvelopeKind,
        fingerprint: u64,
        now: Instant,
    ) -> bool {
        self.dedup
            .get(&(from.clone(), to.clone(), kind))
            .map(|previous| {
                let (seen_at, seen_fingerprint) = *previous;
                seen_fingerprint == fingerprint
                    && now.duration_since(seen_at) < self.config.dedup_window
            })
            .unwrap_or(false)
    }

    fn mark_seen(
        &self,
        from: &UserId,
        to: &UserId,
        kind: EnvelopeKind,
        fingerprint: u64,
        now: Instant,
    ) {
        self.dedup
            .insert((from.clone(), to.clone(), kind), (now, fingerprint));
    }

    /// Route one envelope. Always produces an explicit outcome; never throws
    /// and never silently drops.
    fn route(&self, from: &UserId, to: &UserId, signal: SignalPayload) -> Result<(), RelayRejection> {
        let kind = signal.kind();
        let now = Instant::now();

        if to.as_str().is_empty() || to == from {
            increment_counter!("relay_rejected_total");
            return Err(RelayRejection::Invalid);
        }

        if !self.limiter.check(from, kind, now) {
            increment_counter!("relay_rate_limited_total");
            warn!(from = %from, kind = %kind, "rate limit exceeded");
            return Err(RelayRejection::RateLimited);
        }

        let fingerprint = payload_fingerprint(&signal);
        if self.is_duplicate(from, to, kind, fingerprint, now) {
            increment_counter!("relay_deduplicated_total");
            debug!(from = %from, to = %to, kind = %kind, "suppressing duplicate envelope");
            return Ok(());
        }

        let channel = match self.channels.get(to) {
            Some(channel) => channel.clone(),
            None => return Err(RelayRejection::TargetNotFound),
        };

        let envelope = ServerMessage::Envelope {
            from: from.clone(),
            sent_at: Utc::now(),
            signal: signal.clone(),
        };
        if channel.tx.send(envelope).is_err() {
            return Err(RelayRejection::TargetDisconnected);
        }
        self.mark_seen(from, to, kind, fingerprint, now);

        // Bookkeeping after a successful hand-off.
        match &signal {
            SignalPayload::Offer(_) => {
                let count = self.pending.record_offer(from, to);
                if count > 2 {
                    warn!(
                        from = %from,
                        to = %to,
                        offers = count,
                        "repeated unanswered offers on one pair"
                    );
                }
            }
            SignalPayload::Answer(_) => {
                // `from` answers the offer that `to` opened.
                self.pending.resolve_answer(to, from);
            }
            SignalPayload::ConnectionState(state) => {
                if state.phase.clears_pending() {
                    self.pending.resolve_connected(from, to);
                }
            }
            SignalPayload::IceCandidate(_) => {}
        }

        increment_counter!("relay_envelopes_total");
        Ok(())
    }

    async fn touch(&self, user: &UserId) {
        let lock = self
            .channels
            .get(user)
            .map(|channel| channel.last_seen.clone());
        if let Some(lock) = lock {
            *lock.write().await = Instant::now();
        }
    }
}

fn payload_fingerprint(signal: &SignalPayload) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    serde_json::to_string(signal)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

/// WebSocket upgrade handler for `/ws/:user_id`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    let user = UserId::new(user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: UserId, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let epoch = state.register(&user, tx.clone());

    let writer_user = user.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(user = %writer_user, error = %err, "failed to encode server message");
                }
            }
        }
        debug!(user = %writer_user, "writer task ended");
    });

    info!(user = %user, epoch, "signaling channel connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(user = %user, error = %err, "websocket error");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: "binary frames must contain utf-8 json".into(),
                    });
                    continue;
                }
            },
            Message::Close(_) => break,
            // Axum answers protocol-level pings itself.
            _ => continue,
        };

        // Canonical first, legacy translated at this boundary only.
        let Some(message) = legacy::parse_client_message(&text) else {
            let _ = tx.send(ServerMessage::Error {
                message: "unrecognized message format".into(),
            });
            continue;
        };

        state.touch(&user).await;

        match message {
            ClientMessage::Envelope { seq, to, signal } => {
                let ack = match state.route(&user, &to, signal) {
                    Ok(()) => ServerMessage::Ack {
                        seq,
                        accepted: true,
                        reason: None,
                    },
                    Err(reason) => ServerMessage::Ack {
                        seq,
                        accepted: false,
                        reason: Some(reason),
                    },
                };
                if tx.send(ack).is_err() {
                    break;
                }
            }
            ClientMessage::Ping => {
                if tx.send(ServerMessage::Pong).is_err() {
                    break;
                }
            }
        }
    }

    state.drop_user(&user, epoch);
    writer.abort();
    info!(user = %user, epoch, "signaling channel disconnected");
}
