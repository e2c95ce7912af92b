use std::env;
use std::time::Duration;

/// Engine tuning knobs. The numeric values are illustrative defaults shared
/// with the relay; every one can be overridden through the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a deferred negotiation trigger waits before retrying.
    pub defer_delay: Duration,
    /// Base delay before restarting after a signaling conflict.
    pub backoff_base: Duration,
    /// Random extra delay added to the backoff so both glare losers do not
    /// collide again in lockstep.
    pub backoff_jitter: Duration,
    /// Window a session gets at each escalation tier before the monitor acts.
    pub tier_window: Duration,
    /// Total failed attempts allowed before the session is marked failed.
    pub retry_cap: u32,
    pub heartbeat_interval: Duration,
    pub stats_interval: Duration,
    /// Delay before the single retry of a candidate that failed to apply.
    pub candidate_retry_delay: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            defer_delay: millis("BANTER_DEFER_DELAY_MS", defaults.defer_delay),
            backoff_base: millis("BANTER_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_jitter: millis("BANTER_BACKOFF_JITTER_MS", defaults.backoff_jitter),
            tier_window: millis("BANTER_TIER_WINDOW_MS", defaults.tier_window),
            retry_cap: parse("BANTER_RETRY_CAP", defaults.retry_cap),
            heartbeat_interval: millis("BANTER_HEARTBEAT_MS", defaults.heartbeat_interval),
            stats_interval: millis("BANTER_STATS_INTERVAL_MS", defaults.stats_interval),
            candidate_retry_delay: millis(
                "BANTER_CANDIDATE_RETRY_MS",
                defaults.candidate_retry_delay,
            ),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            defer_delay: Duration::from_millis(250),
            backoff_base: Duration::from_millis(500),
            backoff_jitter: Duration::from_millis(250),
            tier_window: Duration::from_secs(5),
            retry_cap: 15,
            heartbeat_interval: Duration::from_secs(2),
            stats_interval: Duration::from_secs(2),
            candidate_retry_delay: Duration::from_secs(2),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
