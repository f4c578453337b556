//! `HealthPolicy` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::engine::set::ObjectKey;

/// Kind of liveness check
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LivenessType {
    /// All add-ons deployed to the cluster are provisioned
    Addons,
    /// A `HealthDefinition` evaluated in the cluster reports healthy resources
    HealthCheck,
}

impl std::fmt::Display for LivenessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Addons => write!(f, "Addons"),
            Self::HealthCheck => write!(f, "HealthCheck"),
        }
    }
}

/// Reference to the object backing a liveness check
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LivenessSourceRef {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

/// One evaluable unit of health
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LivenessCheck {
    /// Name, unique within the policy
    pub name: String,

    #[serde(rename = "type")]
    pub check_type: LivenessType,

    /// Required for `HealthCheck`: the `HealthDefinition` to evaluate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_source_ref: Option<LivenessSourceRef>,
}

/// Channel a notification is delivered through
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NotificationType {
    KubernetesEvent,
    Slack,
    Discord,
}

/// Secret holding channel configuration (webhook URLs)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Name, unique within the policy
    pub name: String,

    #[serde(rename = "type")]
    pub notification_type: NotificationType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_ref: Option<SecretRef>,
}

/// `HealthPolicy` CRD: selects clusters and lists the checks and notifications
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "health.platform", version = "v1alpha1", kind = "HealthPolicy")]
#[kube(status = "HealthPolicyStatus")]
#[kube(printcolumn = r#"{"name":"Selector","type":"string","jsonPath":".spec.clusterSelector"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct HealthPolicySpec {
    /// Label selector expression over cluster labels
    #[serde(default)]
    pub cluster_selector: String,

    /// Evaluated in order; each yields exactly one condition
    #[serde(default)]
    pub liveness_checks: Vec<LivenessCheck>,

    #[serde(default)]
    pub notifications: Vec<Notification>,

    /// Only the replica configured with this shard evaluates the policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
}

impl HealthPolicySpec {
    /// Names of the `HealthDefinition`s referenced by `HealthCheck` liveness checks
    #[must_use]
    pub fn health_definition_names(&self) -> Vec<&str> {
        self.liveness_checks
            .iter()
            .filter(|check| check.check_type == LivenessType::HealthCheck)
            .filter_map(|check| check.liveness_source_ref.as_ref())
            .map(|source| source.name.as_str())
            .collect()
    }
}

/// Status of the `HealthPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthPolicyStatus {
    /// Clusters currently selected, sorted
    #[serde(default)]
    pub matching_clusters: Vec<ObjectKey>,

    /// One entry per matched cluster, in first-match order
    #[serde(default)]
    pub cluster_conditions: Vec<ClusterCondition>,

    /// Configuration problems with the policy itself (e.g. malformed selector)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// Whether an entry has been through an evaluation yet
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EvaluationState {
    #[default]
    NotYetEvaluated,
    Evaluated,
}

/// Per-cluster evaluation result inside a policy status
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub cluster: ObjectKey,

    #[serde(default)]
    pub state: EvaluationState,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub notification_summaries: Vec<NotificationSummary>,

    /// Last dispatch failure for this cluster, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl ClusterCondition {
    /// Fresh entry for a cluster that has just started matching
    #[must_use]
    pub fn pending(cluster: ObjectKey) -> Self {
        Self {
            cluster,
            state: EvaluationState::NotYetEvaluated,
            conditions: Vec::new(),
            notification_summaries: Vec::new(),
            failure_message: None,
        }
    }

    /// Evaluated and every condition is `True`
    #[must_use]
    pub fn is_passing(&self) -> bool {
        self.state == EvaluationState::Evaluated
            && self
                .conditions
                .iter()
                .all(|c| c.status == ConditionStatus::True)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Outcome of one liveness check
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Derived from the liveness check (see `condition_type`)
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    pub name: String,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}
