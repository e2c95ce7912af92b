//! Edge adapter for the legacy client message format.
//!
//! Older clients send loosely-shaped JSON of the form
//! `{"action": "offer"|"answer"|"candidate"|"state", "target": "...", "data": {...}}`.
//! The relay translates these into the canonical [`ClientMessage`] at the
//! socket boundary so the router and the engine only ever see one shape.

use serde_json::Value;

use crate::{
    CandidatePayload, ClientMessage, ConnectionPhase, ConnectionStatePayload, SdpPayload,
    SignalPayload, UserId,
};

/// Parse an incoming text frame as the canonical format first, falling back to
/// the legacy translation. Returns `None` for frames that are neither.
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    if let Ok(message) = serde_json::from_str::<ClientMessage>(text) {
        return Some(message);
    }
    let value: Value = serde_json::from_str(text).ok()?;
    from_legacy(&value)
}

/// Translate one legacy-shaped value into the canonical message.
pub fn from_legacy(value: &Value) -> Option<ClientMessage> {
    let action = value.get("action")?.as_str()?;
    if action == "ping" {
        return Some(ClientMessage::Ping);
    }

    let to = UserId::new(value.get("target")?.as_str()?);
    let seq = value.get("seq").and_then(Value::as_u64).unwrap_or(0);
    let data = value.get("data")?;

    let signal = match action {
        "offer" | "answer" => {
            let sdp = data.get("sdp")?.as_str()?.to_string();
            let payload = SdpPayload {
                sdp,
                typ: action.to_string(),
            };
            if action == "offer" {
                SignalPayload::Offer(payload)
            } else {
                SignalPayload::Answer(payload)
            }
        }
        "candidate" => SignalPayload::IceCandidate(CandidatePayload {
            candidate: data.get("candidate")?.as_str()?.to_string(),
            sdp_mid: data
                .get("sdpMid")
                .and_then(Value::as_str)
                .map(str::to_string),
            sdp_mline_index: data
                .get("sdpMLineIndex")
                .and_then(Value::as_u64)
                .map(|idx| idx as u16),
        }),
        "state" => {
            let phase = match data.get("state")?.as_str()? {
                "checking" => ConnectionPhase::Checking,
                "connected" => ConnectionPhase::Connected,
                "completed" => ConnectionPhase::Completed,
                "disconnected" => ConnectionPhase::Disconnected,
                "failed" => ConnectionPhase::Failed,
                "closed" => ConnectionPhase::Closed,
                _ => return None,
            };
            SignalPayload::ConnectionState(ConnectionStatePayload { phase })
        }
        _ => return None,
    };

    Some(ClientMessage::Envelope { seq, to, signal })
}
