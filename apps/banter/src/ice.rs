use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Escalation tier for NAT traversal. Tiers are tried strictly in order and a
/// session never moves back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceTier {
    /// Broad STUN + TURN set, unrestricted transport policy.
    Standard,
    /// Reduced server set chosen for faster candidate gathering.
    Fast,
    /// All traffic forced through TURN; requires a full session rebuild
    /// because the transport policy cannot change on a live session.
    RelayOnly,
}

impl IceTier {
    pub fn index(self) -> u8 {
        match self {
            IceTier::Standard => 0,
            IceTier::Fast => 1,
            IceTier::RelayOnly => 2,
        }
    }

    pub fn next(self) -> Option<IceTier> {
        match self {
            IceTier::Standard => Some(IceTier::Fast),
            IceTier::Fast => Some(IceTier::RelayOnly),
            IceTier::RelayOnly => None,
        }
    }
}

impl std::fmt::Display for IceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IceTier::Standard => "standard",
            IceTier::Fast => "fast",
            IceTier::RelayOnly => "relay_only",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPolicy {
    All,
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Time-limited traversal descriptor for one tier. Treated as opaque input by
/// the negotiator and refreshed on every tier escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceDescriptor {
    pub tier: IceTier,
    pub servers: Vec<IceServerConfig>,
    pub policy: TransportPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IceConfigProvider: Send + Sync {
    async fn fetch(&self, tier: IceTier) -> Result<IceDescriptor, EngineError>;
}

/// Built-in descriptors, used standalone and as the fallback when the remote
/// configuration service is unreachable.
#[derive(Debug, Default, Clone)]
pub struct StaticIceConfig;

impl StaticIceConfig {
    pub fn descriptor(tier: IceTier) -> IceDescriptor {
        let stun = |url: &str| IceServerConfig {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        };
        match tier {
            IceTier::Standard => IceDescriptor {
                tier,
                servers: vec![
                    stun("stun:stun.l.google.com:19302"),
                    stun("stun:stun1.l.google.com:19302"),
                    stun("stun:stun2.l.google.com:19302"),
                ],
                policy: TransportPolicy::All,
                expires_at: None,
            },
            IceTier::Fast => IceDescriptor {
                tier,
                servers: vec![stun("stun:stun.l.google.com:19302")],
                policy: TransportPolicy::All,
                expires_at: None,
            },
            IceTier::RelayOnly => IceDescriptor {
                tier,
                servers: Vec::new(),
                policy: TransportPolicy::Relay,
                expires_at: None,
            },
        }
    }
}

#[async_trait]
impl IceConfigProvider for StaticIceConfig {
    async fn fetch(&self, tier: IceTier) -> Result<IceDescriptor, EngineError> {
        Ok(Self::descriptor(tier))
    }
}

/// Fetches tier descriptors (including short-lived TURN credentials) from a
/// configuration service. Falls back to the static defaults when the service
/// is unreachable so escalation never stalls on a config outage.
pub struct HttpIceConfig {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IceConfigProvider for HttpIceConfig {
    async fn fetch(&self, tier: IceTier) -> Result<IceDescriptor, EngineError> {
        let url = format!(
            "{}/ice-config?tier={}",
            self.base_url.trim_end_matches('/'),
            tier.index()
        );
        let response = self.client.get(&url).send().await;
        match response {
            Ok(response) if response.status().is_success() => response
                .json::<IceDescriptor>()
                .await
                .map_err(|err| EngineError::Validation(format!("bad ice descriptor: {err}"))),
            Ok(response) => {
                debug!(status = %response.status(), %tier, "ice config service refused; using static descriptor");
                Ok(StaticIceConfig::descriptor(tier))
            }
            Err(err) => {
                debug!(error = %err, %tier, "ice config service unreachable; using static descriptor");
                Ok(StaticIceConfig::descriptor(tier))
            }
        }
    }
}
