use thiserror::Error;

use crate::link::LinkError;
use crate::media::DeviceError;

/// Engine-level error taxonomy. Everything except `Fatal` is handled inside
/// the engine; callers only observe state transitions and terminal outcomes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input or an impossible request (e.g. calling yourself).
    #[error("validation error: {0}")]
    Validation(String),

    /// The relay refused the send for now; retry later, no state change.
    #[error("rate limited by relay")]
    RateLimited,

    /// Glare, stale answer, or wrong signaling state; recovered locally.
    #[error("signaling conflict: {0}")]
    SignalingConflict(String),

    /// ICE-level trouble; drives the escalation policy.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Microphone unavailable after the relaxed-constraint fallback.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Signaling channel to the relay is gone.
    #[error("signaling channel closed")]
    SignalingClosed,

    /// Retry cap exceeded, explicit hangup, or remote disconnection.
    #[error("session terminated: {0}")]
    Fatal(String),
}

impl From<LinkError> for EngineError {
    fn from(err: LinkError) -> Self {
        EngineError::Transport(err.to_string())
    }
}
