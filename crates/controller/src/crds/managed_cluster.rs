//! `ManagedCluster` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `ManagedCluster` CRD: a cluster registered directly (without Cluster API).
/// Policies select it by its metadata labels.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "health.platform", version = "v1alpha1", kind = "ManagedCluster")]
#[kube(namespaced)]
#[kube(status = "ManagedClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Secret holding the kubeconfig used to reach the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_name: Option<String>,

    /// Paused clusters are selected but not evaluated
    #[serde(default)]
    pub paused: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default)]
    pub ready: bool,
}
