use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use banter_relay::{app, Config, RelayState};

/// Signaling relay for banter voice sessions.
#[derive(Debug, Parser)]
#[command(name = "banter-relay")]
struct Cli {
    /// Listen port; overrides BANTER_RELAY_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    if let Some(metrics_addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("failed to install metrics exporter")?;
        info!(%metrics_addr, "metrics exporter listening");
    }

    let addr = format!("0.0.0.0:{}", config.port);
    info!(
        port = config.port,
        offer_limit = config.offer_limit,
        candidate_limit = config.candidate_limit,
        "starting banter relay"
    );

    let state = RelayState::new(config);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app(state))
        .await
        .context("relay server exited")?;
    Ok(())
}
