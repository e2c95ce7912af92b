//! Wire protocol shared by the banter relay and the client engine.
//! Keeping this in a dedicated crate lets the relay and the engine agree on
//! one canonical envelope shape; legacy client formats are translated at the
//! relay boundary (see [`legacy`]) and never reach the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod legacy;

/// Stable logical user identity. Survives signaling reconnects, unlike the
/// transport-level socket identity which is reissued on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Discriminant for the four envelope kinds. Used for rate limiting and
/// deduplication keys on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    ConnectionState,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice_candidate",
            EnvelopeKind::ConnectionState => "connection_state",
        };
        f.write_str(name)
    }
}

/// An SDP-style session description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    /// "offer" or "answer"; mirrored from the description itself so the
    /// receiving side can validate kind against signaling state.
    #[serde(rename = "type")]
    pub typ: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Coarse transport phase carried in `connection_state` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionPhase {
    /// Phases that settle an outstanding offer on the relay.
    pub fn clears_pending(self) -> bool {
        matches!(self, ConnectionPhase::Connected | ConnectionPhase::Completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatePayload {
    pub phase: ConnectionPhase,
}

/// The canonical signaling payload: one tagged union, normalized at the relay
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer(SdpPayload),
    Answer(SdpPayload),
    IceCandidate(CandidatePayload),
    ConnectionState(ConnectionStatePayload),
}

impl SignalPayload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            SignalPayload::Offer(_) => EnvelopeKind::Offer,
            SignalPayload::Answer(_) => EnvelopeKind::Answer,
            SignalPayload::IceCandidate(_) => EnvelopeKind::IceCandidate,
            SignalPayload::ConnectionState(_) => EnvelopeKind::ConnectionState,
        }
    }
}

/// A routed envelope as the relay sees it after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub from: UserId,
    pub to: UserId,
    pub sent_at: DateTime<Utc>,
    pub signal: SignalPayload,
}

/// Why the relay refused to deliver an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRejection {
    TargetNotFound,
    TargetDisconnected,
    RateLimited,
    Invalid,
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Envelope {
        /// Client-chosen sequence number, echoed back in the ack.
        seq: u64,
        to: UserId,
        signal: SignalPayload,
    },
    Ping,
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Every `Envelope` send is acked exactly once, accepted or not.
    Ack {
        seq: u64,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RelayRejection>,
    },
    Envelope {
        from: UserId,
        sent_at: DateTime<Utc>,
        signal: SignalPayload,
    },
    Pong,
    Error {
        message: String,
    },
}
