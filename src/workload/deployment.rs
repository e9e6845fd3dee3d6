//! Deployment workload provider

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Client;

use super::{paged_for_each, WorkloadCallback, WorkloadProvider};
use crate::error::Result;

pub struct DeploymentProvider;

#[async_trait]
impl WorkloadProvider for DeploymentProvider {
    fn kind(&self) -> &'static str {
        "Deployment"
    }

    async fn for_each(
        &self,
        client: &Client,
        namespace: &str,
        selector: Option<&LabelSelector>,
        callback: WorkloadCallback<'_>,
    ) -> Result<()> {
        paged_for_each::<Deployment>(client, namespace, selector, self.kind(), callback).await
    }
}
