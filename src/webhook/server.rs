//! Admission webhook server
//!
//! One mutating endpoint per managed workload kind. Handlers never reject a
//! request: the response is always allowed, side effects run inline, and
//! failures are logged and recorded. The next reconciler pass corrects any
//! divergence an admission failure leaves behind.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::mutator::{self, SelectorFn, WorkloadImage};
use crate::controller::metrics;
use crate::error::{Error, Result};

/// Webhook server state
pub struct WebhookState {
    pub client: Client,
}

/// Builds the admission router.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(health_handler))
        .route("/mutate-deployments", post(mutate_deployments))
        .route("/mutate-statefulsets", post(mutate_statefulsets))
        .route("/mutate-daemonsets", post(mutate_daemonsets))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the webhook server. TLS termination is delegated to the deployment
/// environment (e.g. a sidecar or the webhook service mesh).
pub async fn run_server(state: Arc<WebhookState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("Starting admission webhook server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Webhook server error: {e}")))?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn mutate_deployments(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Deployment>>,
) -> impl IntoResponse {
    handle_review(&state, review, "Deployment", mutator::deployment_selector).await
}

async fn mutate_statefulsets(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<StatefulSet>>,
) -> impl IntoResponse {
    handle_review(&state, review, "StatefulSet", mutator::stateful_set_selector).await
}

async fn mutate_daemonsets(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DaemonSet>>,
) -> impl IntoResponse {
    handle_review(&state, review, "DaemonSet", mutator::daemon_set_selector).await
}

async fn handle_review<K>(
    state: &WebhookState,
    review: AdmissionReview<K>,
    kind: &'static str,
    selector_fn: SelectorFn,
) -> (StatusCode, Json<AdmissionReview<DynamicObject>>)
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Clone + Debug,
{
    let request: AdmissionRequest<K> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!("Failed to parse admission request: {}", err);
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid admission request: {err}"))
                        .into_review(),
                ),
            );
        }
    };

    let start = Instant::now();
    let operation = operation_label(&request.operation);
    let fallback_namespace = request.namespace.clone().unwrap_or_default();

    let object = request
        .object
        .as_ref()
        .map(|object| WorkloadImage::from_object(object, &fallback_namespace));
    let old_object = request
        .old_object
        .as_ref()
        .map(|object| WorkloadImage::from_object(object, &fallback_namespace));

    let result = mutator::mutate(
        &state.client,
        kind,
        selector_fn,
        &request.operation,
        object,
        old_object,
    )
    .await;

    metrics::record_admission(operation, start, result.as_ref().err());

    if let Err(err) = &result {
        // The workload is admitted regardless; the periodic reconciler will
        // converge whatever this pass could not.
        error!(
            "Webhook handler error for {} {} of {}: {}",
            operation, kind, request.name, err
        );
    }

    (
        StatusCode::OK,
        Json(AdmissionResponse::from(&request).into_review()),
    )
}

fn operation_label(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}
