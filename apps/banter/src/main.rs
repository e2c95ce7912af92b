use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use banter::config::EngineConfig;
use banter::ice::{HttpIceConfig, IceConfigProvider, StaticIceConfig};
use banter::link::webrtc::WebRtcLinkFactory;
use banter::media::device::SystemMediaSource;
use banter::session::{CallEvent, SessionManager};
use banter::signaling::ws::WsSignaling;
use banter_proto::UserId;

/// Place a voice call to a matched partner through a banter relay.
#[derive(Debug, Parser)]
#[command(name = "banter")]
struct Cli {
    /// Relay base URL, e.g. http://localhost:8090
    #[arg(long, env = "BANTER_RELAY_URL", default_value = "http://localhost:8090")]
    relay_url: String,

    /// Stable logical user id to sign in as.
    #[arg(long, env = "BANTER_USER")]
    user: String,

    /// Partner id supplied by matchmaking. Without one, wait for an inbound
    /// call instead.
    #[arg(long)]
    call: Option<String>,

    /// Optional ICE configuration service base URL.
    #[arg(long, env = "BANTER_ICE_URL")]
    ice_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let local = UserId::new(cli.user.clone());

    let signaling = Arc::new(
        WsSignaling::connect(&cli.relay_url, &local)
            .await
            .context("failed to reach the relay")?,
    );
    let ice: Arc<dyn IceConfigProvider> = match &cli.ice_url {
        Some(url) => Arc::new(HttpIceConfig::new(url.clone())),
        None => Arc::new(StaticIceConfig),
    };

    let manager = SessionManager::new(
        local.clone(),
        signaling,
        Arc::new(WebRtcLinkFactory::new()),
        Arc::new(SystemMediaSource::new()),
        ice,
        EngineConfig::from_env(),
    );

    let router = manager.clone();
    tokio::spawn(async move { router.run().await });

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::StateChanged { remote, state } => {
                    info!(%remote, ?state, "call state")
                }
                CallEvent::TierEscalated { remote, tier } => {
                    info!(%remote, %tier, "escalated traversal tier")
                }
                CallEvent::Terminated { remote, reason } => {
                    info!(%remote, ?reason, "call ended")
                }
            }
        }
    });

    let partner = cli.call.clone().map(UserId::new);
    if let Some(partner) = &partner {
        manager.place_call(partner.clone())?;
        info!(remote = %partner, "calling");
    } else {
        info!(user = %local, "waiting for inbound calls");
    }

    // Tiny stdin console: mute / unmute / hangup / quit.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        let Some(partner) = &partner else {
            continue;
        };
        let result = match line.trim() {
            "mute" => manager.mute(partner),
            "unmute" => manager.unmute(partner),
            "hangup" => manager.hangup(partner),
            "quit" => break,
            "" => Ok(()),
            other => {
                error!(command = other, "unknown command (mute|unmute|hangup|quit)");
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(error = %err, "command failed");
        }
    }

    manager.shutdown().await;
    Ok(())
}
