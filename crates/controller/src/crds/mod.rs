pub mod addon_summary;
pub mod health_definition;
pub mod health_policy;
pub mod health_report;
pub mod managed_cluster;

pub use addon_summary::*;
pub use health_definition::*;
pub use health_policy::*;
pub use health_report::*;
pub use managed_cluster::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the resources owned by this controller
pub const GROUP: &str = "health.platform";
/// apiVersion of the resources owned by this controller
pub const GROUP_VERSION: &str = "health.platform/v1alpha1";

pub const HEALTH_POLICY_KIND: &str = "HealthPolicy";
pub const HEALTH_DEFINITION_KIND: &str = "HealthDefinition";
pub const MANAGED_CLUSTER_KIND: &str = "ManagedCluster";

/// Cluster API group; its `Cluster` kind is only watched when installed
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";
pub const CAPI_CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
pub const CAPI_CLUSTER_KIND: &str = "Cluster";
/// Name of the Cluster API `Cluster` CustomResourceDefinition
pub const CAPI_CLUSTER_CRD_NAME: &str = "clusters.cluster.x-k8s.io";

/// Which API a target cluster is registered through
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
pub enum ClusterType {
    /// `ManagedCluster` registered directly with this platform
    Managed,
    /// Cluster API `Cluster`
    Capi,
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => write!(f, "Managed"),
            Self::Capi => write!(f, "Capi"),
        }
    }
}
