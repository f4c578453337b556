//! Typed object identifiers and the set primitive every index is built on.

use std::collections::BTreeSet;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crds::{
    ClusterType, CAPI_CLUSTER_API_VERSION, CAPI_CLUSTER_KIND, GROUP_VERSION, HEALTH_DEFINITION_KIND,
    HEALTH_POLICY_KIND, MANAGED_CLUSTER_KIND,
};

/// Identifies one object: namespace, name, kind and apiVersion.
///
/// Two keys are equal only when all four fields are equal, so a
/// `ManagedCluster` and a Cluster API `Cluster` sharing namespace and name are
/// different targets.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub api_version: String,
}

/// A cluster targeted by policies
pub type ClusterRef = ObjectKey;
/// A `HealthPolicy`
pub type PolicyRef = ObjectKey;
/// A `HealthDefinition`
pub type HealthDefRef = ObjectKey;

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: &str, name: &str, kind: &str, api_version: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            api_version: api_version.to_string(),
        }
    }

    /// Key for a cluster of the given type
    #[must_use]
    pub fn cluster(namespace: &str, name: &str, cluster_type: ClusterType) -> Self {
        match cluster_type {
            ClusterType::Managed => Self::new(namespace, name, MANAGED_CLUSTER_KIND, GROUP_VERSION),
            ClusterType::Capi => {
                Self::new(namespace, name, CAPI_CLUSTER_KIND, CAPI_CLUSTER_API_VERSION)
            }
        }
    }

    /// Key for a (cluster-scoped) `HealthPolicy`
    #[must_use]
    pub fn policy(name: &str) -> Self {
        Self::new("", name, HEALTH_POLICY_KIND, GROUP_VERSION)
    }

    /// Key for a (cluster-scoped) `HealthDefinition`
    #[must_use]
    pub fn health_definition(name: &str) -> Self {
        Self::new("", name, HEALTH_DEFINITION_KIND, GROUP_VERSION)
    }

    /// Cluster type implied by the kind; `None` for non-cluster keys
    #[must_use]
    pub fn cluster_type(&self) -> Option<ClusterType> {
        match self.kind.as_str() {
            MANAGED_CLUSTER_KIND => Some(ClusterType::Managed),
            CAPI_CLUSTER_KIND => Some(ClusterType::Capi),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Insertion-order-irrelevant set of object keys.
///
/// Iteration is sorted, which keeps status documents and logs deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSet {
    items: BTreeSet<ObjectKey>,
}

impl ObjectSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the key was not already present
    pub fn insert(&mut self, key: ObjectKey) -> bool {
        self.items.insert(key)
    }

    /// Returns `true` when the key was present
    pub fn erase(&mut self, key: &ObjectKey) -> bool {
        self.items.remove(key)
    }

    #[must_use]
    pub fn has(&self, key: &ObjectKey) -> bool {
        self.items.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectKey> {
        self.items.iter()
    }

    /// Sorted copy of the members
    #[must_use]
    pub fn items(&self) -> Vec<ObjectKey> {
        self.items.iter().cloned().collect()
    }

    /// Members of `self` that are not in `other`
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        self.items.difference(&other.items).cloned().collect()
    }

    /// Members of either set
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.items.union(&other.items).cloned().collect()
    }

    /// Members of both sets
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        self.items.intersection(&other.items).cloned().collect()
    }
}

impl FromIterator<ObjectKey> for ObjectSet {
    fn from_iter<I: IntoIterator<Item = ObjectKey>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ObjectSet {
    type Item = ObjectKey;
    type IntoIter = std::collections::btree_set::IntoIter<ObjectKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObjectSet {
    type Item = &'a ObjectKey;
    type IntoIter = std::collections::btree_set::Iter<'a, ObjectKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
