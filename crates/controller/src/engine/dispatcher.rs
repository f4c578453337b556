//! Deduplicated dispatch of per-(cluster, policy) evaluation jobs.

use std::future::Future;

use tracing::{debug, info};

use super::deployer::{FeatureId, JobKey, JobResult, WorkerPool};
use super::set::{ClusterRef, PolicyRef};
use crate::crds::ClusterType;
use crate::error::Result;

/// Dispatch state of one (cluster, policy, feature) target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    /// A job is queued or running
    Provisioning,
    /// The last job finished successfully and its result has been collected
    Provisioned,
    /// The last job failed; the driver re-submits on its next pass
    Failed(String),
    /// No job in flight and no uncollected result
    Idle,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: WorkerPool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    /// Build the job key for a target
    #[must_use]
    pub fn job_key(cluster: &ClusterRef, policy: &PolicyRef, feature: FeatureId) -> JobKey {
        JobKey {
            cluster_namespace: cluster.namespace.clone(),
            cluster_name: cluster.name.clone(),
            policy_name: policy.name.clone(),
            feature_id: feature,
            cluster_type: cluster.cluster_type().unwrap_or(ClusterType::Managed),
        }
    }

    /// Queue an evaluation job unless one is already in flight for the target.
    /// Returns `true` when a new job was queued.
    pub fn ensure_job<F>(
        &self,
        cluster: &ClusterRef,
        policy: &PolicyRef,
        feature: FeatureId,
        work: F,
    ) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = Self::job_key(cluster, policy, feature);
        let queued = self.pool.ensure_job(key, work);
        if queued {
            info!(cluster = %cluster, policy = %policy.name, "🚀 Queued health evaluation");
        } else {
            debug!(cluster = %cluster, policy = %policy.name, "Health evaluation already in flight");
        }
        queued
    }

    #[must_use]
    pub fn is_in_progress(&self, cluster: &ClusterRef, policy: &PolicyRef, feature: FeatureId) -> bool {
        self.pool.is_in_progress(&Self::job_key(cluster, policy, feature))
    }

    /// Take the terminal result of the last finished job; `None` while running
    /// or when already collected.
    pub fn collect_result(
        &self,
        cluster: &ClusterRef,
        policy: &PolicyRef,
        feature: FeatureId,
    ) -> Option<JobResult> {
        self.pool.take_result(&Self::job_key(cluster, policy, feature))
    }

    /// Collect the current state of a target, consuming any finished result
    pub fn poll(&self, cluster: &ClusterRef, policy: &PolicyRef, feature: FeatureId) -> DispatchState {
        if self.is_in_progress(cluster, policy, feature) {
            return DispatchState::Provisioning;
        }
        match self.collect_result(cluster, policy, feature) {
            Some(JobResult::Deployed) => DispatchState::Provisioned,
            Some(JobResult::Failed(reason)) => DispatchState::Failed(reason),
            None => DispatchState::Idle,
        }
    }

    /// Stop tracking a target that no longer matches
    pub fn discard(&self, cluster: &ClusterRef, policy: &PolicyRef, feature: FeatureId) {
        self.pool.discard(&Self::job_key(cluster, policy, feature));
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
