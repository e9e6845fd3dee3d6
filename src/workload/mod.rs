//! Workload provider abstraction
//!
//! One provider per supported workload kind (Deployment, StatefulSet,
//! DaemonSet). Providers expose a uniform paginated iteration so the
//! reconciler stays kind-agnostic after the initial dispatch; pagination
//! bounds peak memory when a namespace holds thousands of workloads.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::{api::ListParams, Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::selector;

mod daemon_set;
mod deployment;
mod stateful_set;

pub use daemon_set::DaemonSetProvider;
pub use deployment::DeploymentProvider;
pub use stateful_set::StatefulSetProvider;

/// Number of objects fetched per list page.
pub const PAGE_SIZE: u32 = 500;

/// A kind-agnostic view of one workload object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: &'static str,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
}

/// Called for each workload during iteration. Return false to stop early.
pub type WorkloadCallback<'a> = &'a mut (dyn FnMut(WorkloadRef) -> bool + Send);

/// Lists and identifies workloads of a single kind.
#[async_trait]
pub trait WorkloadProvider: Send + Sync {
    /// The workload kind, e.g. "Deployment".
    fn kind(&self) -> &'static str;

    /// Iterates over the workloads in a namespace, page by page.
    ///
    /// With a selector, filtering happens server-side; without one, every
    /// object in the namespace is yielded. A list failure surfaces after the
    /// callbacks for any already-fetched pages have run.
    async fn for_each(
        &self,
        client: &Client,
        namespace: &str,
        selector: Option<&LabelSelector>,
        callback: WorkloadCallback<'_>,
    ) -> Result<()>;
}

pub(crate) async fn paged_for_each<K>(
    client: &Client,
    namespace: &str,
    selector: Option<&LabelSelector>,
    kind: &'static str,
    callback: WorkloadCallback<'_>,
) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    let mut params = ListParams::default().limit(PAGE_SIZE);
    if let Some(selector) = selector {
        let query = selector::selector_to_query(selector)?;
        if !query.is_empty() {
            params = params.labels(&query);
        }
    }

    let mut continue_token: Option<String> = None;
    loop {
        let page = match &continue_token {
            Some(token) => api.list(&params.clone().continue_token(token)).await?,
            None => api.list(&params).await?,
        };
        continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());

        for item in page.items {
            let workload = WorkloadRef {
                kind,
                name: item.name_any(),
                namespace: item.namespace().unwrap_or_else(|| namespace.to_string()),
                uid: item.uid().unwrap_or_default(),
                labels: item.labels().clone(),
            };
            if !callback(workload) {
                return Ok(());
            }
        }

        if continue_token.is_none() {
            break;
        }
    }

    Ok(())
}
