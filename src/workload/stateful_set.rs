//! StatefulSet workload provider

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Client;

use super::{paged_for_each, WorkloadCallback, WorkloadProvider};
use crate::error::Result;

pub struct StatefulSetProvider;

#[async_trait]
impl WorkloadProvider for StatefulSetProvider {
    fn kind(&self) -> &'static str {
        "StatefulSet"
    }

    async fn for_each(
        &self,
        client: &Client,
        namespace: &str,
        selector: Option<&LabelSelector>,
        callback: WorkloadCallback<'_>,
    ) -> Result<()> {
        paged_for_each::<StatefulSet>(client, namespace, selector, self.kind(), callback).await
    }
}
