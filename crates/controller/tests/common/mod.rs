//! In-memory collaborators for driving the engine without a cluster.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use healthcheck_controller::crds::{
    ClusterType, FeatureSummary, HealthPolicy, HealthPolicySpec, HealthPolicyStatus,
    HealthReportSpec, Notification,
};
use healthcheck_controller::engine::{
    AddonStatusSource, ClusterRef, DeliveryOutcome, HealthDefRef, HealthReportSource, Labels,
    ObjectKey, PolicyRef,
};
use healthcheck_controller::error::{Error, Result};
use healthcheck_controller::reconcile::{ClusterPresence, NotificationSink, PolicyStore};
use healthcheck_controller::{ControllerConfig, Engine};
use notify::NotifyEvent;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Policy store with resourceVersion checks on status writes
#[derive(Default)]
pub struct MemoryStore {
    policies: Mutex<HashMap<String, (HealthPolicy, u64)>>,
    clusters: Mutex<HashMap<ClusterRef, ClusterPresence>>,
}

impl MemoryStore {
    pub fn put_policy(&self, name: &str, spec: HealthPolicySpec) -> HealthPolicy {
        let mut policies = self.policies.lock().unwrap();
        let version = policies.get(name).map_or(1, |(_, version)| version + 1);
        let mut policy = HealthPolicy::new(name, spec);
        policy.status = policies.get(name).and_then(|(p, _)| p.status.clone());
        policy.metadata.resource_version = Some(version.to_string());
        policy.metadata.generation = Some(i64::try_from(version).unwrap());
        policies.insert(name.to_string(), (policy.clone(), version));
        policy
    }

    pub fn policy(&self, name: &str) -> HealthPolicy {
        self.policies.lock().unwrap()[name].0.clone()
    }

    pub fn status(&self, name: &str) -> HealthPolicyStatus {
        self.policy(name).status.unwrap_or_default()
    }

    pub fn set_cluster(&self, cluster: &ClusterRef, presence: ClusterPresence) {
        self.clusters.lock().unwrap().insert(cluster.clone(), presence);
    }

    pub fn delete_cluster(&self, cluster: &ClusterRef) {
        self.clusters.lock().unwrap().remove(cluster);
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get_policy(&self, name: &str) -> Result<Option<HealthPolicy>> {
        Ok(self.policies.lock().unwrap().get(name).map(|(p, _)| p.clone()))
    }

    async fn replace_status(&self, policy: &HealthPolicy) -> Result<()> {
        let name = policy.metadata.name.clone().ok_or(Error::MissingObjectKey)?;
        let mut policies = self.policies.lock().unwrap();
        let Some((stored, version)) = policies.get_mut(&name) else {
            return Err(Error::Conflict(name));
        };
        if policy.metadata.resource_version != Some(version.to_string()) {
            return Err(Error::Conflict(name));
        }
        *version += 1;
        stored.status.clone_from(&policy.status);
        stored.metadata.resource_version = Some(version.to_string());
        Ok(())
    }

    async fn cluster_presence(&self, cluster: &ClusterRef) -> Result<ClusterPresence> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .get(cluster)
            .copied()
            .unwrap_or(ClusterPresence::Missing))
    }
}

/// Add-on status per cluster; clusters listed in `failing` return an error
/// and clusters listed in `blocked` wait for `release`
#[derive(Default)]
pub struct FakeAddons {
    pub features: Mutex<HashMap<ClusterRef, Vec<FeatureSummary>>>,
    pub failing: Mutex<Vec<ClusterRef>>,
    pub blocked: Mutex<Vec<ClusterRef>>,
    pub release: Notify,
    calls: Mutex<HashMap<ClusterRef, usize>>,
}

impl FakeAddons {
    /// How many times the add-on status of `cluster` was fetched
    pub fn calls(&self, cluster: &ClusterRef) -> usize {
        self.calls.lock().unwrap().get(cluster).copied().unwrap_or_default()
    }
}

#[async_trait]
impl AddonStatusSource for FakeAddons {
    async fn addon_status(&self, cluster: &ClusterRef, _policy: &PolicyRef) -> Result<Vec<FeatureSummary>> {
        *self.calls.lock().unwrap().entry(cluster.clone()).or_default() += 1;
        let blocked = self.blocked.lock().unwrap().contains(cluster);
        if blocked {
            self.release.notified().await;
        }
        if self.failing.lock().unwrap().contains(cluster) {
            return Err(Error::Evaluation(format!("add-on status of {cluster} unavailable")));
        }
        Ok(self
            .features
            .lock()
            .unwrap()
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }
}

/// Reports per (definition, cluster); clusters listed in `failing` error out
#[derive(Default)]
pub struct FakeReports {
    pub reports: Mutex<HashMap<(HealthDefRef, ClusterRef), HealthReportSpec>>,
    pub failing: Mutex<Vec<ClusterRef>>,
}

#[async_trait]
impl HealthReportSource for FakeReports {
    async fn latest_report(
        &self,
        definition: &HealthDefRef,
        cluster: &ClusterRef,
    ) -> Result<Option<HealthReportSpec>> {
        if self.failing.lock().unwrap().contains(cluster) {
            return Err(Error::Evaluation(format!("health report of {cluster} unreadable")));
        }
        Ok(self
            .reports
            .lock()
            .unwrap()
            .get(&(definition.clone(), cluster.clone()))
            .cloned())
    }
}

/// Records every delivery; notifications named in `failing` fail
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(String, ClusterRef, bool)>>,
    pub failing: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<(String, ClusterRef, bool)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(
        &self,
        notification: &Notification,
        cluster: &ClusterRef,
        event: &NotifyEvent,
    ) -> DeliveryOutcome {
        if self.failing.lock().unwrap().contains(&notification.name) {
            return DeliveryOutcome::Failed("webhook unreachable".to_string());
        }
        self.delivered
            .lock()
            .unwrap()
            .push((notification.name.clone(), cluster.clone(), event.passing));
        DeliveryOutcome::Delivered
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub addons: Arc<FakeAddons>,
    pub reports: Arc<FakeReports>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let addons = Arc::new(FakeAddons::default());
        let reports = Arc::new(FakeReports::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(Engine::new(
            ControllerConfig::default(),
            store.clone(),
            addons.clone(),
            reports.clone(),
            sink.clone(),
            CancellationToken::new(),
        ));
        Self {
            engine,
            store,
            addons,
            reports,
            sink,
        }
    }

    /// Register a live cluster with the store and the index
    pub fn add_cluster(&self, name: &str, cluster_type: ClusterType, labels: &[(&str, &str)]) -> ClusterRef {
        let cluster = ObjectKey::cluster("fleet", name, cluster_type);
        self.store.set_cluster(&cluster, ClusterPresence::Active);
        self.engine.cluster_changed(&cluster, labels_of(labels));
        cluster
    }

    pub async fn reconcile(&self, name: &str) {
        let policy = self.store.policy(name);
        self.engine.reconcile_policy(&policy).await.unwrap();
    }

    /// Poll the stored status until `done` holds
    pub async fn wait_for_status(
        &self,
        name: &str,
        done: impl Fn(&HealthPolicyStatus) -> bool,
    ) -> HealthPolicyStatus {
        for _ in 0..400 {
            let status = self.store.status(name);
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("status of {name} never reached the expected state: {:?}", self.store.status(name));
    }
}

/// Poll `done` until it holds
pub async fn eventually(what: &str, done: impl Fn() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{what} never happened");
}

pub fn labels_of(labels: &[(&str, &str)]) -> Labels {
    labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
