//! VPA Operator Entry Point
//!
//! Starts the VpaManager controller, the admission webhook server, and the
//! metrics and health endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};
use vpa_operator::{config::OperatorConfig, controller, telemetry, webhook, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = OperatorConfig::load()?;
    telemetry::init_tracing(&config);

    info!("Starting VPA operator v{}", env!("CARGO_PKG_VERSION"));

    if config.leader_election_enabled {
        // Single-replica deployments are the norm; the flag is accepted so
        // manifests stay portable across installations.
        warn!("Leader election requested but not active; running as a single replica");
    }

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let metrics_addr: SocketAddr = parse_addr(&config.metrics_bind_address, "metrics")?;
    tokio::spawn(async move {
        if let Err(err) = telemetry::run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {:?}", err);
        }
    });

    let health_addr: SocketAddr = parse_addr(&config.health_probe_bind_address, "health probe")?;
    tokio::spawn(async move {
        if let Err(err) = telemetry::run_health_server(health_addr).await {
            error!("Health probe server error: {:?}", err);
        }
    });

    let webhook_addr: SocketAddr = parse_addr(&config.webhook_bind_address, "webhook")?;
    let webhook_state = Arc::new(webhook::WebhookState {
        client: client.clone(),
    });
    tokio::spawn(async move {
        if let Err(err) = webhook::run_server(webhook_state, webhook_addr).await {
            error!("Webhook server error: {:?}", err);
        }
    });

    let state = Arc::new(controller::ControllerState { client });
    controller::run_controller(state).await?;

    Ok(())
}

fn parse_addr(value: &str, name: &str) -> Result<SocketAddr, Error> {
    value
        .parse()
        .map_err(|err| Error::ConfigError(format!("Invalid {name} bind address {value}: {err}")))
}
