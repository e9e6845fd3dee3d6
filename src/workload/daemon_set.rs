//! DaemonSet workload provider

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Client;

use super::{paged_for_each, WorkloadCallback, WorkloadProvider};
use crate::error::Result;

pub struct DaemonSetProvider;

#[async_trait]
impl WorkloadProvider for DaemonSetProvider {
    fn kind(&self) -> &'static str {
        "DaemonSet"
    }

    async fn for_each(
        &self,
        client: &Client,
        namespace: &str,
        selector: Option<&LabelSelector>,
        callback: WorkloadCallback<'_>,
    ) -> Result<()> {
        paged_for_each::<DaemonSet>(client, namespace, selector, self.kind(), callback).await
    }
}
