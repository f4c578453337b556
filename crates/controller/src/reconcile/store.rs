//! Store collaborator: policy reads, conditional status writes and cluster
//! existence checks.

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, PostParams};
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::crds::{
    ClusterType, HealthPolicy, HealthPolicySpec, HealthPolicyStatus, ManagedCluster,
    CAPI_CLUSTER_KIND, CAPI_GROUP,
};
use crate::engine::set::ClusterRef;
use crate::error::{Error, Result};

/// Whether a cluster can be evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPresence {
    Missing,
    Paused,
    Active,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self, name: &str) -> Result<Option<HealthPolicy>>;

    /// Write `policy.status`, conditional on `metadata.resourceVersion`.
    ///
    /// # Errors
    /// `Error::Conflict` when the stored object changed since it was read.
    async fn replace_status(&self, policy: &HealthPolicy) -> Result<()>;

    async fn cluster_presence(&self, cluster: &ClusterRef) -> Result<ClusterPresence>;
}

/// `ApiResource` of the Cluster API `Cluster` kind
#[must_use]
pub fn capi_cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(CAPI_GROUP, "v1beta1", CAPI_CLUSTER_KIND))
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicyStore for KubeStore {
    async fn get_policy(&self, name: &str) -> Result<Option<HealthPolicy>> {
        let api: Api<HealthPolicy> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn replace_status(&self, policy: &HealthPolicy) -> Result<()> {
        let api: Api<HealthPolicy> = Api::all(self.client.clone());
        let name = policy.name_any();
        let body = serde_json::to_vec(policy)?;

        match api.replace_status(&name, &PostParams::default(), body).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(policy = %name, "Status update conflict");
                Err(Error::Conflict(name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cluster_presence(&self, cluster: &ClusterRef) -> Result<ClusterPresence> {
        match cluster.cluster_type() {
            Some(ClusterType::Managed) => {
                let api: Api<ManagedCluster> =
                    Api::namespaced(self.client.clone(), &cluster.namespace);
                Ok(match api.get_opt(&cluster.name).await? {
                    None => ClusterPresence::Missing,
                    Some(found) if found.spec.paused => ClusterPresence::Paused,
                    Some(_) => ClusterPresence::Active,
                })
            }
            Some(ClusterType::Capi) => {
                let api: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    &cluster.namespace,
                    &capi_cluster_resource(),
                );
                Ok(match api.get_opt(&cluster.name).await? {
                    None => ClusterPresence::Missing,
                    Some(found) if capi_paused(&found) => ClusterPresence::Paused,
                    Some(_) => ClusterPresence::Active,
                })
            }
            None => {
                warn!(cluster = %cluster, "Not a cluster reference");
                Ok(ClusterPresence::Missing)
            }
        }
    }
}

/// `spec.paused` of a Cluster API `Cluster`
#[must_use]
pub fn capi_paused(cluster: &DynamicObject) -> bool {
    cluster
        .data
        .get("spec")
        .and_then(|spec| spec.get("paused"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Re-read, mutate and conditionally write a policy status until the write
/// lands or `retries` conflicting writes have happened.
///
/// `mutate` sees the current spec and status and may be applied several
/// times. When it leaves the status unchanged nothing is written. Returns
/// `None` when the policy no longer exists.
///
/// # Errors
/// `Error::ConflictRetriesExhausted` after `retries` conflicts; any other
/// store error is returned as is.
pub async fn update_status_with_retry<T, F>(
    store: &dyn PolicyStore,
    name: &str,
    retries: u32,
    mut mutate: F,
) -> Result<Option<T>>
where
    F: FnMut(&HealthPolicySpec, &mut HealthPolicyStatus) -> T + Send,
    T: Send,
{
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        let Some(mut policy) = store.get_policy(name).await? else {
            debug!(policy = %name, "Policy gone, skipping status update");
            return Ok(None);
        };

        let original = policy.status.clone().unwrap_or_default();
        let mut status = original.clone();
        let output = mutate(&policy.spec, &mut status);

        if status == original {
            return Ok(Some(output));
        }

        policy.status = Some(status);
        match store.replace_status(&policy).await {
            Ok(()) => return Ok(Some(output)),
            Err(e) if e.is_conflict() => {
                debug!(policy = %name, attempt, "Retrying status update after conflict");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::ConflictRetriesExhausted {
        policy: name.to_string(),
        attempts,
    })
}
