//! `AddonSummary` Custom Resource Definition
//!
//! Written by the add-on deployer, one per (profile, cluster). The `Addons`
//! liveness check only reads the feature statuses.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ClusterType;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum FeatureStatus {
    Provisioning,
    Provisioned,
    Failed,
    FailedNonRetriable,
    Removing,
    Removed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSummary {
    /// Add-on kind (e.g. Helm, Resources, Kustomize)
    pub feature_id: String,
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// `AddonSummary` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "health.platform", version = "v1alpha1", kind = "AddonSummary")]
#[kube(namespaced)]
#[kube(status = "AddonSummaryStatus")]
#[serde(rename_all = "camelCase")]
pub struct AddonSummarySpec {
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub cluster_type: ClusterType,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonSummaryStatus {
    #[serde(default)]
    pub feature_summaries: Vec<FeatureSummary>,
}
