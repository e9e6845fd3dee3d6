//! VpaManager Custom Resource Definition
//!
//! A cluster-scoped policy object declaring which workloads should receive a
//! VerticalPodAutoscaler and what update policy / resource bounds the emitted
//! VPAs carry.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.joaomo.io",
    version = "v1",
    kind = "VpaManager",
    status = "VpaManagerStatus",
    shortname = "vpa",
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"UpdateMode","type":"string","jsonPath":".spec.updateMode"}"#,
    printcolumn = r#"{"name":"ManagedVPAs","type":"integer","jsonPath":".status.managedVPAs"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpaManagerSpec {
    /// Master switch: when false the operator neither creates, updates, nor
    /// deletes VPAs on behalf of this manager.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Update mode copied verbatim into every emitted VPA.
    #[serde(default)]
    pub update_mode: UpdateMode,

    /// Selects the namespaces to manage VPAs in. Absent means all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub namespace_selector: Option<LabelSelector>,

    /// Selects the Deployments to manage VPAs for. Absent means Deployments
    /// are not managed at all; an empty selector matches every Deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub deployment_selector: Option<LabelSelector>,

    /// Selects the StatefulSets to manage VPAs for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub stateful_set_selector: Option<LabelSelector>,

    /// Selects the DaemonSets to manage VPAs for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub daemon_set_selector: Option<LabelSelector>,

    /// Per-container resource bounds embedded in every emitted VPA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<ResourcePolicy>,
}

fn default_enabled() -> bool {
    true
}

/// VPA update mode, emitted verbatim into `spec.updatePolicy.updateMode`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum UpdateMode {
    /// Recommendations only; the VPA controller never touches pods.
    #[default]
    Off,
    /// Requests are assigned at pod creation and never changed afterwards.
    Initial,
    /// Requests are assigned at pod creation and updated by eviction.
    Auto,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Off => "Off",
            UpdateMode::Initial => "Initial",
            UpdateMode::Auto => "Auto",
        }
    }
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource policy for the emitted VPAs.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicy {
    /// Per-container resource policies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// Resource bounds for one container. The name `"*"` targets all containers.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    /// Name of the container this policy applies to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,

    /// Minimum amount of resources allowed, keyed by resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_allowed: Option<BTreeMap<String, String>>,

    /// Maximum amount of resources allowed, keyed by resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed: Option<BTreeMap<String, String>>,
}

/// A workload (Deployment, StatefulSet, or DaemonSet) with a managed VPA.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    /// Workload kind.
    pub kind: String,
    /// Workload name.
    pub name: String,
    /// Workload namespace.
    pub namespace: String,
    /// Workload UID.
    pub uid: String,
    /// Name of the VPA resource managed for this workload.
    pub vpa_name: String,
}

/// Retained for compatibility with earlier releases.
#[deprecated(note = "Use WorkloadReference instead")]
pub type DeploymentReference = WorkloadReference;

/// Observed state of a VpaManager.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpaManagerStatus {
    /// Total number of VPAs managed on behalf of this manager.
    #[serde(rename = "managedVPAs", default)]
    pub managed_vpas: i32,

    /// Compatibility copy of `managedWorkloads`.
    ///
    /// Deprecated: use `managedWorkloads` or the per-kind counts instead.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_deployments: Vec<WorkloadReference>,

    /// All workloads with a managed VPA.
    ///
    /// Deprecated: this list grows with the fleet and is expensive at scale;
    /// prefer the per-kind count fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_workloads: Vec<WorkloadReference>,

    /// Number of Deployments with a managed VPA.
    #[serde(default)]
    pub deployment_count: i32,

    /// Number of StatefulSets with a managed VPA.
    #[serde(default)]
    pub stateful_set_count: i32,

    /// Number of DaemonSets with a managed VPA.
    #[serde(default)]
    pub daemon_set_count: i32,

    /// When the manager was last reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<Time>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_mode_strings() {
        assert_eq!(UpdateMode::Off.as_str(), "Off");
        assert_eq!(UpdateMode::Initial.as_str(), "Initial");
        assert_eq!(UpdateMode::Auto.as_str(), "Auto");
    }

    #[test]
    fn test_update_mode_default_is_off() {
        assert_eq!(UpdateMode::default(), UpdateMode::Off);
    }

    #[test]
    fn test_spec_defaults_from_empty_document() {
        let spec: VpaManagerSpec = serde_json::from_str("{}").expect("spec should deserialize");
        assert!(spec.enabled, "enabled must default to true");
        assert_eq!(spec.update_mode, UpdateMode::Off);
        assert!(spec.namespace_selector.is_none());
        assert!(spec.deployment_selector.is_none());
        assert!(spec.stateful_set_selector.is_none());
        assert!(spec.daemon_set_selector.is_none());
        assert!(spec.resource_policy.is_none());
    }

    #[test]
    fn test_spec_field_names_are_camel_case() {
        let spec = VpaManagerSpec {
            enabled: true,
            update_mode: UpdateMode::Auto,
            namespace_selector: Some(LabelSelector::default()),
            deployment_selector: Some(LabelSelector::default()),
            stateful_set_selector: Some(LabelSelector::default()),
            daemon_set_selector: Some(LabelSelector::default()),
            resource_policy: Some(ResourcePolicy::default()),
        };
        let value = serde_json::to_value(&spec).expect("spec should serialize");
        let object = value.as_object().expect("spec serializes to an object");
        for field in [
            "enabled",
            "updateMode",
            "namespaceSelector",
            "deploymentSelector",
            "statefulSetSelector",
            "daemonSetSelector",
            "resourcePolicy",
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
    }

    #[test]
    fn test_status_uses_managed_vpas_capitalization() {
        let status = VpaManagerStatus {
            managed_vpas: 3,
            ..Default::default()
        };
        let value = serde_json::to_value(&status).expect("status should serialize");
        assert_eq!(value["managedVPAs"], 3);
        assert!(value.get("managedVpas").is_none());
    }

    #[test]
    fn test_workload_reference_round_trip() {
        let reference = WorkloadReference {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: "prod".to_string(),
            uid: "uid-1".to_string(),
            vpa_name: "web-vpa".to_string(),
        };
        let value = serde_json::to_value(&reference).expect("reference should serialize");
        assert_eq!(value["vpaName"], "web-vpa");
        let parsed: WorkloadReference =
            serde_json::from_value(value).expect("reference should deserialize");
        assert_eq!(parsed, reference);
    }

    #[test]
    fn test_container_policy_omits_absent_bounds() {
        let policy = ContainerResourcePolicy {
            container_name: "*".to_string(),
            min_allowed: None,
            max_allowed: None,
        };
        let value = serde_json::to_value(&policy).expect("policy should serialize");
        let object = value.as_object().expect("policy serializes to an object");
        assert!(!object.contains_key("minAllowed"));
        assert!(!object.contains_key("maxAllowed"));
    }
}
