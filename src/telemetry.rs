//! Tracing setup and the metrics/health HTTP surface

use std::net::SocketAddr;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use crate::config::OperatorConfig;
use crate::controller::metrics;
use crate::error::{Error, Result};

/// Initialize the global tracing subscriber from configuration.
///
/// `RUST_LOG` still wins for per-target directives; the configured level is
/// only the default.
pub fn init_tracing(config: &OperatorConfig) {
    let default_directive: Directive = config
        .log_level
        .parse()
        .unwrap_or_else(|_| tracing::Level::INFO.into());
    let filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_encoder == "json" && !config.development_logging_mode {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Serve the Prometheus metrics endpoint.
pub async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler));

    serve(app, addr, "metrics").await
}

/// Serve the liveness/readiness probes.
pub async fn run_health_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(health_handler));

    serve(app, addr, "health probe").await
}

async fn serve(app: Router, addr: SocketAddr, name: &str) -> Result<()> {
    tracing::info!("Starting {} server on {}", name, addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {addr}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("{name} server error: {e}")))?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
