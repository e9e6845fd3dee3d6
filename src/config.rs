//! Operator configuration
//!
//! All knobs are configuration-time and loaded from the environment with the
//! `VPA_OPERATOR` prefix, e.g. `VPA_OPERATOR_LOG_LEVEL=debug`.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Process-level configuration for the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Default tracing directive, overridable per-target via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Verbose, human-oriented logging for local development.
    #[serde(default)]
    pub development_logging_mode: bool,

    /// Log encoder: "json" or "console".
    #[serde(default = "default_log_encoder")]
    pub log_encoder: String,

    /// Minimum level at which log events carry a stacktrace.
    #[serde(default = "default_stacktrace_level")]
    pub stacktrace_level: String,

    /// Whether the process should participate in leader election.
    #[serde(default)]
    pub leader_election_enabled: bool,

    /// Bind address for the Prometheus metrics endpoint.
    #[serde(default = "default_metrics_bind_address")]
    pub metrics_bind_address: String,

    /// Bind address for the health/readiness probes.
    #[serde(default = "default_health_probe_bind_address")]
    pub health_probe_bind_address: String,

    /// Bind address for the admission webhook server.
    #[serde(default = "default_webhook_bind_address")]
    pub webhook_bind_address: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_encoder() -> String {
    "json".to_string()
}

fn default_stacktrace_level() -> String {
    "error".to_string()
}

fn default_metrics_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_probe_bind_address() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_webhook_bind_address() -> String {
    "0.0.0.0:9443".to_string()
}

impl OperatorConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("VPA_OPERATOR"))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            development_logging_mode: false,
            log_encoder: default_log_encoder(),
            stacktrace_level: default_stacktrace_level(),
            leader_election_enabled: false,
            metrics_bind_address: default_metrics_bind_address(),
            health_probe_bind_address: default_health_probe_bind_address(),
            webhook_bind_address: default_webhook_bind_address(),
        }
    }
}
