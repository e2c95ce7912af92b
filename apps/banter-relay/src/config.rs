use std::env;
use std::time::Duration;

/// Relay runtime configuration. Every numeric threshold here is an
/// illustrative default and can be overridden through the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Offers accepted per user inside one rate window.
    pub offer_limit: usize,
    /// ICE candidates accepted per user inside one rate window.
    pub candidate_limit: usize,
    pub rate_window: Duration,
    /// Identical (from, to, kind) repeats inside this window are swallowed.
    pub dedup_window: Duration,
    /// Channels silent for longer than this are swept.
    pub channel_idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Optional address for the Prometheus scrape endpoint.
    pub metrics_addr: Option<std::net::SocketAddr>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("BANTER_RELAY_PORT", defaults.port),
            offer_limit: env_parse("BANTER_RELAY_OFFER_LIMIT", defaults.offer_limit),
            candidate_limit: env_parse("BANTER_RELAY_CANDIDATE_LIMIT", defaults.candidate_limit),
            rate_window: Duration::from_secs(env_parse(
                "BANTER_RELAY_RATE_WINDOW_SECS",
                defaults.rate_window.as_secs(),
            )),
            dedup_window: Duration::from_millis(env_parse(
                "BANTER_RELAY_DEDUP_WINDOW_MS",
                defaults.dedup_window.as_millis() as u64,
            )),
            channel_idle_timeout: Duration::from_secs(env_parse(
                "BANTER_RELAY_IDLE_TIMEOUT_SECS",
                defaults.channel_idle_timeout.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_parse(
                "BANTER_RELAY_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
            metrics_addr: env::var("BANTER_RELAY_METRICS_ADDR")
                .ok()
                .and_then(|addr| addr.parse().ok()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8090,
            offer_limit: 20,
            candidate_limit: 120,
            rate_window: Duration::from_secs(90),
            dedup_window: Duration::from_millis(300),
            channel_idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            metrics_addr: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
