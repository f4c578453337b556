//! `HealthReport` Custom Resource Definition
//!
//! Reports are produced per (cluster, definition) by the evaluator running in
//! the managed cluster and collected into the cluster's namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ClusterType;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
}

/// Evaluated resource in the managed cluster
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportedResource {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub resource: ReportedResource,
    pub health_status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `HealthReport` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "health.platform", version = "v1alpha1", kind = "HealthReport")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct HealthReportSpec {
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub cluster_type: ClusterType,
    pub health_definition_name: String,
    #[serde(default)]
    pub resource_statuses: Vec<ResourceStatus>,
}

impl HealthReportSpec {
    /// Resources that are not `Healthy`
    pub fn unhealthy(&self) -> impl Iterator<Item = &ResourceStatus> {
        self.resource_statuses
            .iter()
            .filter(|status| status.health_status != HealthStatus::Healthy)
    }
}
