//! VerticalPodAutoscaler construction and lifecycle operations.
//!
//! The VPA CRD lives in API group `autoscaling.k8s.io/v1`. Because
//! `k8s-openapi` does not ship VPA types, the resource is modeled as a
//! `DynamicObject` and manipulated through `kube`'s dynamic API helpers
//! (`DynamicObject` + `ApiResource`). All construction happens in
//! [`build_vpa`] so the tree shape lives in one place.
//!
//! Every VPA emitted here carries the `managed-by`/`created-by` label pair;
//! the orphan sweep is scoped by those labels so two managers can never
//! delete each other's VPAs.

use std::collections::HashSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams},
    core::ObjectMeta,
    Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use super::metrics;
use crate::crd::VpaManager;
use crate::error::{Error, Result};

const VPA_GROUP: &str = "autoscaling.k8s.io";
const VPA_VERSION: &str = "v1";
const VPA_KIND: &str = "VerticalPodAutoscaler";

/// Label marking a VPA as emitted by this operator.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "vpa-operator";

/// Label carrying the name of the owning VpaManager.
pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";

/// What [`ensure_vpa`] did to converge the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

/// The `ApiResource` descriptor used to build dynamic VPA APIs.
pub fn vpa_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: VPA_GROUP.to_string(),
        version: VPA_VERSION.to_string(),
        kind: VPA_KIND.to_string(),
    })
}

/// Derives the VPA name from the workload name.
/// Convention: `<workload-name>-vpa`
pub fn vpa_name(workload_name: &str) -> String {
    format!("{workload_name}-vpa")
}

/// Builds the desired VPA for a workload managed by the given VpaManager.
///
/// The owner reference points at the target workload (not the manager), with
/// controller ownership flags set, so cluster garbage collection removes the
/// VPA when the workload is deleted even if the operator is down.
pub fn build_vpa(
    manager: &VpaManager,
    kind: &str,
    name: &str,
    namespace: &str,
    uid: &str,
) -> DynamicObject {
    let vpa_name = vpa_name(name);

    let mut spec = json!({
        "targetRef": {
            "apiVersion": "apps/v1",
            "kind":       kind,
            "name":       name,
        },
        "updatePolicy": {
            "updateMode": manager.spec.update_mode.as_str(),
        },
    });

    // resourcePolicy is omitted entirely when the manager carries no container
    // policies; an empty containerPolicies list is never emitted.
    let container_policies: Vec<serde_json::Value> = manager
        .spec
        .resource_policy
        .as_ref()
        .map(|policy| {
            policy
                .container_policies
                .iter()
                .map(|container| {
                    let mut entry = json!({
                        "containerName": container.container_name,
                    });
                    if let Some(min) = &container.min_allowed {
                        entry["minAllowed"] = json!(min);
                    }
                    if let Some(max) = &container.max_allowed {
                        entry["maxAllowed"] = json!(max);
                    }
                    entry
                })
                .collect()
        })
        .unwrap_or_default();
    if !container_policies.is_empty() {
        spec["resourcePolicy"] = json!({ "containerPolicies": container_policies });
    }

    let mut vpa = DynamicObject::new(&vpa_name, &vpa_api_resource());
    vpa.metadata = ObjectMeta {
        name: Some(vpa_name),
        namespace: Some(namespace.to_string()),
        labels: Some(
            [
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (CREATED_BY_LABEL.to_string(), manager.name_any()),
            ]
            .into_iter()
            .collect(),
        ),
        owner_references: Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };
    vpa.data = json!({ "spec": spec });
    vpa
}

/// Creates or updates the VPA for a workload.
///
/// The update is gated on spec equality: when the existing VPA already
/// carries the desired spec, no write is issued.
pub async fn ensure_vpa(
    client: &Client,
    manager: &VpaManager,
    kind: &str,
    name: &str,
    namespace: &str,
    uid: &str,
) -> Result<EnsureOutcome> {
    let resource = vpa_api_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

    let desired = build_vpa(manager, kind, name, namespace, uid);
    let vpa_name = vpa_name(name);

    match api.get(&vpa_name).await {
        Ok(mut existing) => {
            if existing.data.get("spec") == desired.data.get("spec") {
                return Ok(EnsureOutcome::Unchanged);
            }
            let desired_spec = desired.data["spec"].clone();
            match existing.data.as_object_mut() {
                Some(data) => {
                    data.insert("spec".to_string(), desired_spec);
                }
                None => existing.data = json!({ "spec": desired_spec }),
            }
            api.replace(&vpa_name, &PostParams::default(), &existing)
                .await?;
            debug!("VPA {}/{} spec updated", namespace, vpa_name);
            Ok(EnsureOutcome::Updated)
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            api.create(&PostParams::default(), &desired).await?;
            info!("VPA {}/{} created", namespace, vpa_name);
            Ok(EnsureOutcome::Created)
        }
        Err(err) => Err(Error::KubeError(err)),
    }
}

/// Creates the VPA for a workload unless it already exists.
/// Returns true when a VPA was actually created.
pub async fn create_vpa_if_absent(
    client: &Client,
    manager: &VpaManager,
    kind: &str,
    name: &str,
    namespace: &str,
    uid: &str,
) -> Result<bool> {
    let resource = vpa_api_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

    let vpa_name = vpa_name(name);
    if api.get_opt(&vpa_name).await?.is_some() {
        debug!("VPA {}/{} already exists", namespace, vpa_name);
        return Ok(false);
    }

    let vpa = build_vpa(manager, kind, name, namespace, uid);
    api.create(&PostParams::default(), &vpa).await?;
    info!("VPA {}/{} created", namespace, vpa_name);
    Ok(true)
}

/// Deletes a VPA, treating not-found as already converged.
pub async fn delete_vpa(client: &Client, namespace: &str, vpa_name: &str) -> Result<()> {
    let resource = vpa_api_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

    match api.delete(vpa_name, &DeleteParams::default()).await {
        Ok(_) => {
            info!("VPA {}/{} deleted", namespace, vpa_name);
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!("VPA {}/{} already absent, nothing to delete", namespace, vpa_name);
            Ok(())
        }
        Err(err) => Err(Error::KubeError(err)),
    }
}

/// Deletes every VPA labeled for this manager whose `namespace/name` key is
/// absent from `current`. Not-found during delete is benign. Other delete
/// errors do not stop the sweep; the first one is returned after all
/// candidates have been visited.
pub async fn cleanup_orphaned_vpas(
    client: &Client,
    manager_name: &str,
    current: &HashSet<String>,
) -> Result<usize> {
    let resource = vpa_api_resource();
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);

    let params = ListParams::default().labels(&format!(
        "{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{CREATED_BY_LABEL}={manager_name}"
    ));
    let vpas = api.list(&params).await?;

    let mut deleted = 0;
    let mut first_error: Option<Error> = None;

    for vpa in vpas.items {
        let namespace = vpa.namespace().unwrap_or_default();
        let name = vpa.name_any();
        if current.contains(&format!("{namespace}/{name}")) {
            continue;
        }

        let namespaced: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &resource);
        match namespaced.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Orphaned VPA {}/{} deleted", namespace, name);
                deleted += 1;
                metrics::record_vpa_operation("delete", manager_name);
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                deleted += 1;
                metrics::record_vpa_operation("delete", manager_name);
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(Error::KubeError(err));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(deleted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ContainerResourcePolicy, ResourcePolicy, UpdateMode, VpaManager, VpaManagerSpec,
    };

    fn make_manager(name: &str, update_mode: UpdateMode) -> VpaManager {
        VpaManager::new(
            name,
            VpaManagerSpec {
                enabled: true,
                update_mode,
                namespace_selector: None,
                deployment_selector: None,
                stateful_set_selector: None,
                daemon_set_selector: None,
                resource_policy: None,
            },
        )
    }

    #[test]
    fn test_vpa_name_convention() {
        assert_eq!(vpa_name("web"), "web-vpa");
        assert_eq!(vpa_name("my-app"), "my-app-vpa");
    }

    #[test]
    fn test_build_vpa_basic_structure() {
        let manager = make_manager("platform", UpdateMode::Auto);
        let vpa = build_vpa(&manager, "Deployment", "web", "prod", "uid-1");

        assert_eq!(vpa.metadata.name.as_deref(), Some("web-vpa"));
        assert_eq!(vpa.metadata.namespace.as_deref(), Some("prod"));

        let target = &vpa.data["spec"]["targetRef"];
        assert_eq!(target["apiVersion"], "apps/v1");
        assert_eq!(target["kind"], "Deployment");
        assert_eq!(target["name"], "web");

        assert_eq!(vpa.data["spec"]["updatePolicy"]["updateMode"], "Auto");
    }

    #[test]
    fn test_build_vpa_update_mode_propagation() {
        let manager = make_manager("platform", UpdateMode::Initial);
        let vpa = build_vpa(&manager, "StatefulSet", "db", "prod", "uid-2");
        assert_eq!(vpa.data["spec"]["updatePolicy"]["updateMode"], "Initial");
        assert_eq!(vpa.data["spec"]["targetRef"]["kind"], "StatefulSet");
    }

    #[test]
    fn test_build_vpa_ownership_labels() {
        let manager = make_manager("platform", UpdateMode::Off);
        let vpa = build_vpa(&manager, "DaemonSet", "agent", "kube-system", "uid-3");

        let labels = vpa.metadata.labels.as_ref().expect("labels must be present");
        assert_eq!(
            labels.get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
        assert_eq!(
            labels.get(CREATED_BY_LABEL).map(String::as_str),
            Some("platform")
        );
    }

    #[test]
    fn test_build_vpa_owner_reference_targets_workload() {
        let manager = make_manager("platform", UpdateMode::Off);
        let vpa = build_vpa(&manager, "Deployment", "web", "prod", "uid-4");

        let owners = vpa
            .metadata
            .owner_references
            .as_ref()
            .expect("owner references must be present");
        assert_eq!(owners.len(), 1);
        let owner = &owners[0];
        assert_eq!(owner.api_version, "apps/v1");
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "web");
        assert_eq!(owner.uid, "uid-4");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn test_build_vpa_omits_resource_policy_without_policies() {
        let mut manager = make_manager("platform", UpdateMode::Auto);
        let vpa = build_vpa(&manager, "Deployment", "web", "prod", "uid-5");
        assert!(vpa.data["spec"].get("resourcePolicy").is_none());

        // An empty containerPolicies list must also be omitted.
        manager.spec.resource_policy = Some(ResourcePolicy {
            container_policies: vec![],
        });
        let vpa = build_vpa(&manager, "Deployment", "web", "prod", "uid-5");
        assert!(vpa.data["spec"].get("resourcePolicy").is_none());
    }

    #[test]
    fn test_build_vpa_resource_policy_propagation() {
        let mut manager = make_manager("platform", UpdateMode::Auto);
        manager.spec.resource_policy = Some(ResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "*".to_string(),
                min_allowed: Some(
                    [
                        ("cpu".to_string(), "100m".to_string()),
                        ("memory".to_string(), "100Mi".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                max_allowed: Some(
                    [
                        ("cpu".to_string(), "1".to_string()),
                        ("memory".to_string(), "1Gi".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
            }],
        });

        let vpa = build_vpa(&manager, "Deployment", "web", "prod", "uid-6");
        let policies = &vpa.data["spec"]["resourcePolicy"]["containerPolicies"];
        assert_eq!(policies.as_array().expect("policies is an array").len(), 1);
        let policy = &policies[0];
        assert_eq!(policy["containerName"], "*");
        assert_eq!(policy["minAllowed"]["cpu"], "100m");
        assert_eq!(policy["minAllowed"]["memory"], "100Mi");
        assert_eq!(policy["maxAllowed"]["cpu"], "1");
        assert_eq!(policy["maxAllowed"]["memory"], "1Gi");
    }

    #[test]
    fn test_build_vpa_partial_bounds() {
        let mut manager = make_manager("platform", UpdateMode::Initial);
        manager.spec.resource_policy = Some(ResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "sidecar".to_string(),
                min_allowed: None,
                max_allowed: Some([("cpu".to_string(), "2".to_string())].into_iter().collect()),
            }],
        });

        let vpa = build_vpa(&manager, "Deployment", "web", "prod", "uid-7");
        let policy = &vpa.data["spec"]["resourcePolicy"]["containerPolicies"][0];
        assert!(policy.get("minAllowed").is_none());
        assert_eq!(policy["maxAllowed"]["cpu"], "2");
    }

    #[test]
    fn test_build_vpa_is_deterministic() {
        let manager = make_manager("platform", UpdateMode::Auto);
        let first = build_vpa(&manager, "Deployment", "web", "prod", "uid-8");
        let second = build_vpa(&manager, "Deployment", "web", "prod", "uid-8");
        assert_eq!(
            serde_json::to_value(&first).expect("vpa serializes"),
            serde_json::to_value(&second).expect("vpa serializes")
        );
    }
}
