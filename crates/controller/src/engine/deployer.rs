//! Bounded worker pool running keyed evaluation jobs.
//!
//! A job key is `(clusterNamespace, clusterName, policyName, featureId,
//! clusterType)`. At most one job per key is in flight; the outcome is kept
//! until collected. Jobs never retry on their own.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crds::ClusterType;
use crate::error::Result;

/// Unit of work a job performs for a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureId {
    ClusterHealthCheck,
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterHealthCheck => write!(f, "ClusterHealthCheck"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub policy_name: String,
    pub feature_id: FeatureId,
    pub cluster_type: ClusterType,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}:{}:{}",
            self.cluster_type,
            self.cluster_namespace,
            self.cluster_name,
            self.policy_name,
            self.feature_id
        )
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Deployed,
    Failed(String),
}

#[derive(Debug, Default)]
struct JobTable {
    in_progress: HashSet<JobKey>,
    results: HashMap<JobKey, JobResult>,
    // Running jobs whose result nobody will collect
    discarded: HashSet<JobKey>,
}

/// Worker pool shared by every dispatcher call
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    job_timeout: Duration,
    shutdown: CancellationToken,
    jobs: Arc<Mutex<JobTable>>,
}

impl WorkerPool {
    /// Pool running at most `workers` jobs at once, each bounded by `job_timeout`
    #[must_use]
    pub fn new(workers: usize, job_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            job_timeout,
            shutdown,
            jobs: Arc::new(Mutex::new(JobTable::default())),
        }
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `work` under `key` unless a job for that key is already running.
    ///
    /// Returns `true` when a new job was queued. Queuing discards any
    /// uncollected result of an earlier job for the same key.
    pub fn ensure_job<F>(&self, key: JobKey, work: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        {
            let mut table = self.table();
            if !table.in_progress.insert(key.clone()) {
                debug!(job = %key, "Job already in progress");
                return false;
            }
            table.results.remove(&key);
        }

        let permits = Arc::clone(&self.permits);
        let jobs = Arc::clone(&self.jobs);
        let shutdown = self.shutdown.clone();
        let job_timeout = self.job_timeout;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => JobResult::Failed("worker pool shutting down".to_string()),
                outcome = run_job(permits, job_timeout, work) => outcome,
            };

            if let JobResult::Failed(reason) = &outcome {
                warn!(job = %key, reason = %reason, "Job failed");
            } else {
                debug!(job = %key, "Job completed");
            }

            let mut table = jobs.lock().unwrap_or_else(PoisonError::into_inner);
            table.in_progress.remove(&key);
            if !table.discarded.remove(&key) {
                table.results.insert(key, outcome);
            }
        });

        true
    }

    #[must_use]
    pub fn is_in_progress(&self, key: &JobKey) -> bool {
        self.table().in_progress.contains(key)
    }

    /// Take the outcome of the last finished job for `key`, if not yet taken
    pub fn take_result(&self, key: &JobKey) -> Option<JobResult> {
        self.table().results.remove(key)
    }

    /// Drop the stored result for `key`; a job still running for it will
    /// not store one either
    pub fn discard(&self, key: &JobKey) {
        let mut table = self.table();
        table.results.remove(key);
        if table.in_progress.contains(key) {
            table.discarded.insert(key.clone());
        }
    }

    #[cfg(test)]
    fn stored_results(&self) -> usize {
        self.table().results.len()
    }

    /// Cancel every queued and running job
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_job<F>(permits: Arc<Semaphore>, job_timeout: Duration, work: F) -> JobResult
where
    F: Future<Output = Result<()>>,
{
    let Ok(_permit) = permits.acquire_owned().await else {
        return JobResult::Failed("worker pool closed".to_string());
    };

    match tokio::time::timeout(job_timeout, work).await {
        Ok(Ok(())) => JobResult::Deployed,
        Ok(Err(e)) => JobResult::Failed(e.to_string()),
        Err(_) => JobResult::Failed(format!("timed out after {job_timeout:?}")),
    }
}
