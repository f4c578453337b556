//! Kubernetes-backed sources for add-on status and health reports.
//!
//! Both `AddonSummary` and `HealthReport` objects live in the namespace of the
//! cluster they describe and are matched by the cluster fields of their spec.

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

use crate::crds::{AddonSummary, ClusterType, FeatureSummary, HealthReport, HealthReportSpec};
use crate::engine::set::{ClusterRef, HealthDefRef, PolicyRef};
use crate::engine::{AddonStatusSource, HealthReportSource};
use crate::error::Result;

pub struct KubeReports {
    client: Client,
}

impl KubeReports {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn describes(cluster: &ClusterRef, namespace: &str, name: &str, cluster_type: ClusterType) -> bool {
    cluster.namespace == namespace
        && cluster.name == name
        && cluster.cluster_type() == Some(cluster_type)
}

#[async_trait]
impl AddonStatusSource for KubeReports {
    async fn addon_status(&self, cluster: &ClusterRef, policy: &PolicyRef) -> Result<Vec<FeatureSummary>> {
        let api: Api<AddonSummary> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let summaries = api.list(&ListParams::default()).await?;

        let features: Vec<FeatureSummary> = summaries
            .items
            .into_iter()
            .filter(|summary| {
                describes(
                    cluster,
                    &summary.spec.cluster_namespace,
                    &summary.spec.cluster_name,
                    summary.spec.cluster_type,
                )
            })
            .filter_map(|summary| summary.status)
            .flat_map(|status| status.feature_summaries)
            .collect();

        debug!(cluster = %cluster, policy = %policy.name, features = features.len(), "Collected add-on status");
        Ok(features)
    }
}

#[async_trait]
impl HealthReportSource for KubeReports {
    async fn latest_report(
        &self,
        definition: &HealthDefRef,
        cluster: &ClusterRef,
    ) -> Result<Option<HealthReportSpec>> {
        let api: Api<HealthReport> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let reports = api.list(&ListParams::default()).await?;

        Ok(latest_matching(reports.items, definition, cluster))
    }
}

/// Most recently created report for `definition` in `cluster`
fn latest_matching(
    reports: Vec<HealthReport>,
    definition: &HealthDefRef,
    cluster: &ClusterRef,
) -> Option<HealthReportSpec> {
    reports
        .into_iter()
        .filter(|report| {
            report.spec.health_definition_name == definition.name
                && describes(
                    cluster,
                    &report.spec.cluster_namespace,
                    &report.spec.cluster_name,
                    report.spec.cluster_type,
                )
        })
        .max_by_key(|report| report.metadata.creation_timestamp.clone().map(|t| t.0))
        .map(|report| report.spec)
}
