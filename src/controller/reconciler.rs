//! Main reconciler for VpaManager resources
//!
//! Implements the level-triggered convergence path using the kube-rs runtime:
//! namespace filter, workload enumeration, VPA ensure, orphan sweep, status
//! patch. One worker runs per VpaManager key; the event source coalesces
//! queued triggers, so a single pass covers any number of events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::{ObjectRef, Store},
        watcher,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::{metrics, vpa};
use crate::crd::{VpaManager, VpaManagerSpec, VpaManagerStatus, WorkloadReference};
use crate::error::{Error, Result};
use crate::selector;
use crate::workload::{
    DaemonSetProvider, DeploymentProvider, StatefulSetProvider, WorkloadProvider, WorkloadRef,
};

/// How long to wait before the next periodic pass over a manager.
const REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
}

type SelectorFn = for<'a> fn(&'a VpaManagerSpec) -> Option<&'a LabelSelector>;

/// Pairs a workload provider with the spec field selecting its kind.
struct WorkloadConfig {
    provider: Box<dyn WorkloadProvider>,
    selector: SelectorFn,
}

fn deployment_selector(spec: &VpaManagerSpec) -> Option<&LabelSelector> {
    spec.deployment_selector.as_ref()
}

fn stateful_set_selector(spec: &VpaManagerSpec) -> Option<&LabelSelector> {
    spec.stateful_set_selector.as_ref()
}

fn daemon_set_selector(spec: &VpaManagerSpec) -> Option<&LabelSelector> {
    spec.daemon_set_selector.as_ref()
}

fn workload_configs() -> Vec<WorkloadConfig> {
    vec![
        WorkloadConfig {
            provider: Box::new(DeploymentProvider),
            selector: deployment_selector,
        },
        WorkloadConfig {
            provider: Box::new(StatefulSetProvider),
            selector: stateful_set_selector,
        },
        WorkloadConfig {
            provider: Box::new(DaemonSetProvider),
            selector: daemon_set_selector,
        },
    ]
}

/// Main entry point to start the controller.
///
/// Required cluster permissions:
/// - `operators.joaomo.io/vpamanagers`: get, list, watch; `/status`: patch
/// - `apps/deployments`, `apps/statefulsets`, `apps/daemonsets`: get, list, watch
/// - `autoscaling.k8s.io/verticalpodautoscalers`: get, list, watch, create, update, delete
/// - `namespaces`: get, list, watch
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let managers: Api<VpaManager> = Api::all(client.clone());

    info!("Starting VpaManager controller");

    // Verify CRD exists
    match managers.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("VpaManager CRD is available"),
        Err(err) => {
            error!(
                "VpaManager CRD not found. Please install the CRD first: {:?}",
                err
            );
            return Err(Error::ConfigError(
                "VpaManager CRD not installed".to_string(),
            ));
        }
    }

    let controller = Controller::new(managers, watcher::Config::default());
    let store = controller.store();

    controller
        // A namespace change re-enqueues every enabled manager whose
        // namespace selector matches the namespace's labels.
        .watches(
            Api::<Namespace>::all(client.clone()),
            watcher::Config::default(),
            {
                let store = store.clone();
                move |namespace: Namespace| {
                    let labels = namespace.labels().clone();
                    store
                        .state()
                        .into_iter()
                        .filter(|manager| {
                            manager.spec.enabled
                                && selector::matches_selector(
                                    &labels,
                                    manager.spec.namespace_selector.as_ref(),
                                )
                        })
                        .map(|manager| ObjectRef::from_obj(manager.as_ref()))
                        .collect::<Vec<_>>()
                }
            },
        )
        // A workload change re-enqueues every enabled manager. No
        // predicate-based debouncing: idempotent reconciles plus the periodic
        // requeue bound the work.
        .watches(
            Api::<Deployment>::all(client.clone()),
            watcher::Config::default(),
            enqueue_enabled_managers(store.clone()),
        )
        .watches(
            Api::<StatefulSet>::all(client.clone()),
            watcher::Config::default(),
            enqueue_enabled_managers(store.clone()),
        )
        .watches(
            Api::<DaemonSet>::all(client.clone()),
            watcher::Config::default(),
            enqueue_enabled_managers(store.clone()),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(err) => error!("Reconcile error: {:?}", err),
            }
        })
        .await;

    Ok(())
}

fn enqueue_enabled_managers<K>(
    store: Store<VpaManager>,
) -> impl Fn(K) -> Vec<ObjectRef<VpaManager>> + Send + Sync + 'static
where
    K: Resource,
{
    move |_workload| {
        store
            .state()
            .into_iter()
            .filter(|manager| manager.spec.enabled)
            .map(|manager| ObjectRef::from_obj(manager.as_ref()))
            .collect()
    }
}

/// One convergence pass for one VpaManager.
#[instrument(skip(manager, ctx), fields(vpamanager = %manager.name_any()))]
pub async fn reconcile(manager: Arc<VpaManager>, ctx: Arc<ControllerState>) -> Result<Action> {
    let start = Instant::now();
    let name = manager.name_any();
    let result = reconcile_inner(&name, &ctx).await;
    metrics::record_reconcile(&name, start, result.as_ref().err());
    result
}

async fn reconcile_inner(name: &str, ctx: &ControllerState) -> Result<Action> {
    let client = &ctx.client;
    let api: Api<VpaManager> = Api::all(client.clone());

    // Re-read the manager so the pass works from fresh state, not the cache.
    let Some(manager) = api.get_opt(name).await? else {
        info!("VpaManager {} not found, likely deleted", name);
        return Ok(Action::await_change());
    };

    // Disabled managers are a recorded no-op; their existing VPAs are left in
    // place until the manager is re-enabled or deleted.
    if !manager.spec.enabled {
        info!("VpaManager {} is disabled, skipping reconciliation", name);
        return Ok(Action::await_change());
    }

    let namespaces =
        matching_namespaces(client, manager.spec.namespace_selector.as_ref()).await?;

    let configs = workload_configs();
    let mut managed: Vec<WorkloadReference> = Vec::new();
    let mut watched_workloads = 0usize;

    for namespace in &namespaces {
        for config in &configs {
            let Some(kind_selector) = (config.selector)(&manager.spec) else {
                // No selector for this kind means the kind is not managed.
                continue;
            };

            let mut candidates: Vec<WorkloadRef> = Vec::new();
            if let Err(err) = config
                .provider
                .for_each(client, namespace, Some(kind_selector), &mut |workload| {
                    candidates.push(workload);
                    true
                })
                .await
            {
                warn!(
                    "Failed to list {}s in {}: {}",
                    config.provider.kind(),
                    namespace,
                    err
                );
                continue;
            }

            watched_workloads += candidates.len();
            for workload in candidates {
                match vpa::ensure_vpa(
                    client,
                    &manager,
                    workload.kind,
                    &workload.name,
                    &workload.namespace,
                    &workload.uid,
                )
                .await
                {
                    Ok(vpa::EnsureOutcome::Created) => {
                        metrics::record_vpa_operation("create", name);
                    }
                    Ok(vpa::EnsureOutcome::Updated) => {
                        metrics::record_vpa_operation("update", name);
                    }
                    Ok(vpa::EnsureOutcome::Unchanged) => {}
                    Err(err) => {
                        // Per-workload failures are isolated; the sweep moves on.
                        warn!(
                            "Failed to ensure VPA for {} {}/{}: {}",
                            workload.kind, workload.namespace, workload.name, err
                        );
                        continue;
                    }
                }
                managed.push(WorkloadReference {
                    kind: workload.kind.to_string(),
                    name: workload.name.clone(),
                    namespace: workload.namespace.clone(),
                    uid: workload.uid.clone(),
                    vpa_name: vpa::vpa_name(&workload.name),
                });
            }
        }
    }

    // A sweep failure still surfaces for retry, but only after the status
    // patch below so the counts stay fresh.
    let sweep_error = match vpa::cleanup_orphaned_vpas(client, name, &current_vpa_keys(&managed))
        .await
    {
        Ok(deleted) => {
            if deleted > 0 {
                info!("Deleted {} orphaned VPAs", deleted);
            }
            None
        }
        Err(err) => {
            warn!("Failed to clean up orphaned VPAs: {}", err);
            Some(err)
        }
    };

    // Patch only the status sub-resource, merged against the state observed
    // at the start of this pass, so concurrent writers on other sub-objects
    // cannot collide on resourceVersion.
    let status = build_status(managed, Time(Utc::now()));
    let managed_count = status.managed_vpas;
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply("vpa-operator"),
        &Patch::Merge(&patch),
    )
    .await?;

    metrics::update_managed_gauges(name, i64::from(managed_count), watched_workloads as i64);

    if let Some(err) = sweep_error {
        return Err(err);
    }

    info!(
        "Reconciliation complete for {}: managedVPAs={}, watchedWorkloads={}",
        name, managed_count, watched_workloads
    );
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// Namespaces matching the selector; an absent selector selects all.
async fn matching_namespaces(
    client: &Client,
    namespace_selector: Option<&LabelSelector>,
) -> Result<Vec<String>> {
    let api: Api<Namespace> = Api::all(client.clone());

    let mut params = ListParams::default();
    if let Some(selector) = namespace_selector {
        let query = selector::selector_to_query(selector)?;
        if !query.is_empty() {
            params = params.labels(&query);
        }
    }

    let namespaces = api.list(&params).await?;
    Ok(namespaces
        .items
        .into_iter()
        .map(|namespace| namespace.name_any())
        .collect())
}

/// The `namespace/vpa-name` keys of the VPAs that should currently exist.
fn current_vpa_keys(managed: &[WorkloadReference]) -> HashSet<String> {
    managed
        .iter()
        .map(|workload| format!("{}/{}", workload.namespace, workload.vpa_name))
        .collect()
}

fn build_status(managed: Vec<WorkloadReference>, now: Time) -> VpaManagerStatus {
    let count_kind = |kind: &str| managed.iter().filter(|w| w.kind == kind).count() as i32;

    VpaManagerStatus {
        managed_vpas: managed.len() as i32,
        deployment_count: count_kind("Deployment"),
        stateful_set_count: count_kind("StatefulSet"),
        daemon_set_count: count_kind("DaemonSet"),
        managed_deployments: managed.clone(),
        managed_workloads: managed,
        last_reconcile_time: Some(now),
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(manager: Arc<VpaManager>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!(
        "Reconciliation error for {}: {:?}",
        manager.name_any(),
        error
    );

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(kind: &str, name: &str, namespace: &str) -> WorkloadReference {
        WorkloadReference {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: format!("uid-{name}"),
            vpa_name: vpa::vpa_name(name),
        }
    }

    #[test]
    fn test_workload_configs_cover_all_kinds() {
        let kinds: Vec<&str> = workload_configs()
            .iter()
            .map(|config| config.provider.kind())
            .collect();
        assert_eq!(kinds, vec!["Deployment", "StatefulSet", "DaemonSet"]);
    }

    #[test]
    fn test_workload_config_selectors_map_to_spec_fields() {
        let spec = VpaManagerSpec {
            enabled: true,
            update_mode: Default::default(),
            namespace_selector: None,
            deployment_selector: Some(LabelSelector::default()),
            stateful_set_selector: None,
            daemon_set_selector: Some(LabelSelector::default()),
            resource_policy: None,
        };
        let configs = workload_configs();
        assert!((configs[0].selector)(&spec).is_some(), "deployment selector");
        assert!((configs[1].selector)(&spec).is_none(), "statefulset selector");
        assert!((configs[2].selector)(&spec).is_some(), "daemonset selector");
    }

    #[test]
    fn test_build_status_counts_per_kind() {
        let managed = vec![
            reference("Deployment", "web", "prod"),
            reference("Deployment", "api", "prod"),
            reference("StatefulSet", "db", "prod"),
            reference("DaemonSet", "agent", "kube-system"),
        ];
        let status = build_status(managed, Time(Utc::now()));

        assert_eq!(status.managed_vpas, 4);
        assert_eq!(status.deployment_count, 2);
        assert_eq!(status.stateful_set_count, 1);
        assert_eq!(status.daemon_set_count, 1);
        assert_eq!(
            status.managed_vpas,
            status.deployment_count + status.stateful_set_count + status.daemon_set_count
        );
        assert_eq!(status.managed_workloads.len(), 4);
        assert_eq!(status.managed_deployments, status.managed_workloads);
        assert!(status.last_reconcile_time.is_some());
    }

    #[test]
    fn test_build_status_empty() {
        let status = build_status(vec![], Time(Utc::now()));
        assert_eq!(status.managed_vpas, 0);
        assert_eq!(status.deployment_count, 0);
        assert!(status.managed_workloads.is_empty());
    }

    #[test]
    fn test_current_vpa_keys() {
        let managed = vec![
            reference("Deployment", "web", "prod"),
            reference("StatefulSet", "db", "data"),
        ];
        let keys = current_vpa_keys(&managed);
        assert!(keys.contains("prod/web-vpa"));
        assert!(keys.contains("data/db-vpa"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_requeue_interval_is_five_minutes() {
        assert_eq!(REQUEUE_INTERVAL, Duration::from_secs(300));
    }
}
