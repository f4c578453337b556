//! `HealthDefinition` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resources in the managed cluster a definition evaluates
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ResourceSelector {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `HealthDefinition` CRD: a named evaluation rule referenced by liveness checks.
///
/// The rule itself runs inside the managed cluster; this controller only reads
/// the `HealthReport`s it produces.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "health.platform", version = "v1alpha1", kind = "HealthDefinition")]
#[serde(rename_all = "camelCase")]
pub struct HealthDefinitionSpec {
    pub resource_selectors: Vec<ResourceSelector>,

    /// Opaque evaluation expression
    #[serde(default)]
    pub evaluate_health: String,
}
