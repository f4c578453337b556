//! Reconciliation driver tying the index, dispatcher, evaluator and
//! aggregator together.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::schedule::EvaluationSchedule;
use super::sink::{health_event, NotificationSink};
use super::store::{update_status_with_retry, ClusterPresence, PolicyStore};
use crate::config::ControllerConfig;
use crate::crds::{HealthPolicy, Notification};
use crate::engine::aggregator::{
    ensure_cluster_entry, is_cluster_entry_removed, merge, prune_cluster_entries, record_delivery,
    set_failure_message,
};
use crate::engine::{
    AddonStatusSource, ClusterRef, DispatchState, Dispatcher, Evaluator, FeatureId,
    HealthDefRef, HealthReportSource, Labels, ObjectKey, ObjectSet, PolicyRef,
    PolicyRegistration, SelectorIndex, WorkerPool,
};
use crate::error::{Error, Result};

/// The only job feature: one evaluation pass per (cluster, policy)
const FEATURE: FeatureId = FeatureId::ClusterHealthCheck;

/// Shared state of the health controller
pub struct Engine {
    index: SelectorIndex,
    dispatcher: Dispatcher,
    evaluator: Evaluator,
    store: Arc<dyn PolicyStore>,
    sink: Arc<dyn NotificationSink>,
    schedule: EvaluationSchedule,
    config: ControllerConfig,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn PolicyStore>,
        addons: Arc<dyn AddonStatusSource>,
        reports: Arc<dyn HealthReportSource>,
        sink: Arc<dyn NotificationSink>,
        shutdown: CancellationToken,
    ) -> Self {
        let pool = WorkerPool::new(config.workers, config.job_timeout(), shutdown);
        Self {
            index: SelectorIndex::new(config.shard()),
            dispatcher: Dispatcher::new(pool),
            evaluator: Evaluator::new(addons, reports, config.remote_call_timeout()),
            store,
            sink,
            schedule: EvaluationSchedule::new(config.evaluation_interval()),
            config,
        }
    }

    #[must_use]
    pub fn index(&self) -> &SelectorIndex {
        &self.index
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Cancel every queued and running evaluation
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    /// Stop scheduling and tracking jobs for a pair that no longer matches
    fn forget_pair(&self, policy: &PolicyRef, cluster: &ClusterRef) {
        self.schedule.forget_pair(policy, cluster);
        self.dispatcher.discard(cluster, policy, FEATURE);
    }

    /// Cluster created or relabeled; returns the policies to reconcile
    pub fn cluster_changed(&self, cluster: &ClusterRef, labels: Labels) -> ObjectSet {
        let affected = self.index.update_cluster_labels(cluster, labels);
        let current = self.index.policies_for_cluster(cluster);
        for policy in affected.iter() {
            if current.has(policy) {
                self.schedule.mark_pair(policy, cluster);
            } else {
                self.forget_pair(policy, cluster);
            }
        }
        self.schedule.invalidate_presence(cluster);
        affected
    }

    /// Cluster deleted; returns the policies that matched it
    pub fn cluster_deleted(&self, cluster: &ClusterRef) -> ObjectSet {
        let affected = self.index.remove_cluster(cluster);
        for policy in affected.iter() {
            self.forget_pair(policy, cluster);
        }
        self.schedule.forget_cluster(cluster);
        affected
    }

    /// Presence of a matched cluster, looked up in the store at most once
    /// per evaluation interval unless a watch event invalidated it
    async fn presence(&self, cluster: &ClusterRef) -> Result<ClusterPresence> {
        if let Some(presence) = self.schedule.cached_presence(cluster) {
            return Ok(presence);
        }
        let presence = self.store.cluster_presence(cluster).await?;
        if presence != ClusterPresence::Missing {
            self.schedule.record_presence(cluster, presence);
        }
        Ok(presence)
    }

    /// Add-on status of a cluster changed
    pub fn addons_changed(&self, cluster: &ClusterRef) -> ObjectSet {
        let affected = self.index.policies_for_cluster(cluster);
        for policy in affected.iter() {
            self.schedule.mark_pair(policy, cluster);
        }
        affected
    }

    /// A health report for `definition` arrived from `cluster`
    pub fn report_changed(&self, definition: &HealthDefRef, cluster: &ClusterRef) -> ObjectSet {
        let affected = self
            .index
            .policies_for_health_definition(definition)
            .intersection(&self.index.policies_for_cluster(cluster));
        for policy in affected.iter() {
            self.schedule.mark_pair(policy, cluster);
        }
        affected
    }

    /// A `HealthDefinition` changed; every cluster of its policies is stale
    pub fn definition_changed(&self, definition: &HealthDefRef) -> ObjectSet {
        let affected = self.index.policies_for_health_definition(definition);
        for policy in affected.iter() {
            self.schedule.mark_policy(policy);
        }
        affected
    }

    /// Bring the index and status of one policy up to date and queue due
    /// evaluations.
    ///
    /// # Errors
    /// Store failures and exhausted status retries; the controller requeues.
    #[instrument(skip_all, fields(policy = %policy.metadata.name.as_deref().unwrap_or_default()))]
    pub async fn reconcile_policy(self: &Arc<Self>, policy: &HealthPolicy) -> Result<Action> {
        let name = policy.metadata.name.clone().ok_or(Error::MissingObjectKey)?;
        let policy_ref = ObjectKey::policy(&name);
        let spec = &policy.spec;
        let retries = self.config.status_update_retries;

        if !self.index.owns_shard(spec.shard_key.as_deref()) {
            debug!(shard = ?spec.shard_key, "Policy belongs to another shard");
            self.index.remove_policy(&policy_ref);
            self.schedule.forget_policy(&policy_ref);
            return Ok(Action::await_change());
        }

        self.schedule
            .observe_generation(&policy_ref, policy.metadata.generation);

        let registration = PolicyRegistration {
            selector: spec.cluster_selector.clone(),
            shard_key: spec.shard_key.clone(),
            health_definitions: spec
                .health_definition_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        let update = match self.index.update_policy(&policy_ref, registration) {
            Ok(update) => update,
            Err(e) => {
                warn!(selector = %spec.cluster_selector, error = %e, "Invalid cluster selector");
                let message = Error::from(e).to_string();
                update_status_with_retry(self.store.as_ref(), &name, retries, |_, status| {
                    status.failure_message = Some(message.clone());
                    status.matching_clusters.clear();
                    prune_cluster_entries(status, &ObjectSet::new());
                })
                .await?;
                self.schedule.forget_policy(&policy_ref);
                return Ok(Action::await_change());
            }
        };

        for cluster in update.removed.iter() {
            self.forget_pair(&policy_ref, cluster);
        }
        if !update.added.is_empty() || !update.removed.is_empty() {
            info!(added = update.added.len(), removed = update.removed.len(), "🎯 Policy matches changed");
        }

        let mut matches = update.matches;
        let mut paused = ObjectSet::new();
        for cluster in matches.items() {
            match self.presence(&cluster).await? {
                ClusterPresence::Missing => {
                    debug!(cluster = %cluster, "Matched cluster no longer exists");
                    self.cluster_deleted(&cluster);
                    matches.erase(&cluster);
                }
                ClusterPresence::Paused => {
                    paused.insert(cluster);
                }
                ClusterPresence::Active => {}
            }
        }

        let mut failures = BTreeMap::new();
        for cluster in matches.iter() {
            if let DispatchState::Failed(reason) = self.dispatcher.poll(cluster, &policy_ref, FEATURE) {
                failures.insert(cluster.clone(), reason);
            }
        }

        let matching = matches.items();
        let detached = update_status_with_retry(self.store.as_ref(), &name, retries, |_, status| {
            status.failure_message = None;
            status.matching_clusters.clone_from(&matching);
            for cluster in &matching {
                ensure_cluster_entry(status, cluster);
            }
            let pruned = prune_cluster_entries(status, &matches);
            for (cluster, reason) in &failures {
                set_failure_message(status, cluster, Some(reason.clone()));
            }
            pruned
                .into_iter()
                .filter(|cluster| is_cluster_entry_removed(status, cluster))
                .collect::<Vec<_>>()
        })
        .await?
        .unwrap_or_default();

        for cluster in &detached {
            info!(cluster = %cluster, "🧹 Removed cluster entry from policy status");
            self.forget_pair(&policy_ref, cluster);
        }

        for cluster in matches.iter() {
            if paused.has(cluster) {
                debug!(cluster = %cluster, "Cluster paused, skipping evaluation");
                continue;
            }
            if self.dispatcher.is_in_progress(cluster, &policy_ref, FEATURE) {
                continue;
            }
            if !self.schedule.is_due(&policy_ref, cluster) {
                continue;
            }

            let engine = Arc::clone(self);
            let job_cluster = cluster.clone();
            let job_policy = policy_ref.clone();
            let queued = self.dispatcher.ensure_job(cluster, &policy_ref, FEATURE, async move {
                engine.process_cluster(&job_cluster, &job_policy).await
            });
            if queued {
                self.schedule.dispatched(&policy_ref, cluster);
            }
        }

        Ok(Action::requeue(self.config.evaluation_interval()))
    }

    /// Forget a deleted policy
    #[instrument(skip_all, fields(policy = %policy.metadata.name.as_deref().unwrap_or_default()))]
    pub fn cleanup_policy(&self, policy: &HealthPolicy) -> Result<Action> {
        let name = policy.metadata.name.as_deref().ok_or(Error::MissingObjectKey)?;
        let policy_ref = ObjectKey::policy(name);
        let released = self.index.remove_policy(&policy_ref);
        for cluster in released.iter() {
            self.dispatcher.discard(cluster, &policy_ref, FEATURE);
        }
        self.schedule.forget_policy(&policy_ref);
        info!(released = released.len(), "🗑️ Released HealthPolicy");
        Ok(Action::await_change())
    }

    /// One evaluation job: evaluate, merge into the status and deliver the
    /// notifications that became due.
    ///
    /// # Errors
    /// Per-check evaluation errors are returned after the merge so the
    /// conditions are stored before the job is marked failed.
    #[instrument(skip_all, fields(cluster = %cluster, policy = %policy.name))]
    pub async fn process_cluster(&self, cluster: &ClusterRef, policy: &PolicyRef) -> Result<()> {
        let retries = self.config.status_update_retries;

        let Some(current) = self.store.get_policy(&policy.name).await? else {
            debug!("Policy deleted before evaluation");
            return Ok(());
        };
        if !self.index.matches_for_policy(policy).has(cluster) {
            debug!("Cluster no longer matches, skipping evaluation");
            return Ok(());
        }

        let evaluation = self
            .evaluator
            .evaluate(cluster, policy, &current.spec)
            .await;

        let conditions = evaluation.conditions.clone();
        let passing = evaluation.passing;
        let due = update_status_with_retry(
            self.store.as_ref(),
            &policy.name,
            retries,
            |spec, status| -> Vec<Notification> {
                if !status.matching_clusters.contains(cluster) {
                    return Vec::new();
                }
                let names = merge(status, cluster, conditions.clone(), passing, &spec.notifications);
                spec.notifications
                    .iter()
                    .filter(|n| names.contains(&n.name))
                    .cloned()
                    .collect()
            },
        )
        .await?
        .unwrap_or_default();

        if !due.is_empty() {
            let event = health_event(&policy.name, cluster, &evaluation.conditions, passing);
            let mut outcomes = Vec::with_capacity(due.len());
            for notification in &due {
                let outcome = self.sink.deliver(notification, cluster, &event).await;
                outcomes.push((notification.name.clone(), outcome));
            }

            update_status_with_retry(self.store.as_ref(), &policy.name, retries, |_, status| {
                for (name, outcome) in &outcomes {
                    record_delivery(status, cluster, name, outcome);
                }
            })
            .await?;
        }

        info!(
            passing,
            conditions = evaluation.conditions.len(),
            notified = due.len(),
            "✅ Evaluated cluster health"
        );

        match evaluation.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::crds::{
        ClusterType, ConditionStatus, EvaluationState, FeatureStatus, FeatureSummary,
        HealthPolicySpec, HealthPolicyStatus, LivenessCheck, LivenessType, NotificationStatus,
        NotificationType,
    };
    use crate::engine::evaluator::{MockAddonStatusSource, MockHealthReportSource};
    use crate::engine::DeliveryOutcome;
    use crate::reconcile::sink::MockNotificationSink;
    use crate::reconcile::store::MockPolicyStore;

    fn spec(selector: &str) -> HealthPolicySpec {
        HealthPolicySpec {
            cluster_selector: selector.to_string(),
            liveness_checks: vec![LivenessCheck {
                name: "core".to_string(),
                check_type: LivenessType::Addons,
                liveness_source_ref: None,
            }],
            notifications: vec![Notification {
                name: "event".to_string(),
                notification_type: NotificationType::KubernetesEvent,
                notification_ref: None,
            }],
            shard_key: None,
        }
    }

    fn stored_policy(selector: &str, status: HealthPolicyStatus) -> HealthPolicy {
        let mut policy = HealthPolicy::new("prod", spec(selector));
        policy.status = Some(status);
        policy
    }

    /// Store mock backed by one shared policy object
    fn shared_store(policy: &Arc<Mutex<HealthPolicy>>) -> MockPolicyStore {
        let mut store = MockPolicyStore::new();
        let read = Arc::clone(policy);
        store
            .expect_get_policy()
            .returning(move |_| Ok(Some(read.lock().unwrap().clone())));
        let write = Arc::clone(policy);
        store.expect_replace_status().returning(move |updated| {
            write.lock().unwrap().status.clone_from(&updated.status);
            Ok(())
        });
        store
            .expect_cluster_presence()
            .returning(|_| Ok(ClusterPresence::Active));
        store
    }

    fn engine(
        store: MockPolicyStore,
        addons: MockAddonStatusSource,
        sink: MockNotificationSink,
    ) -> Arc<Engine> {
        Arc::new(Engine::new(
            ControllerConfig::default(),
            Arc::new(store),
            Arc::new(addons),
            Arc::new(MockHealthReportSource::new()),
            Arc::new(sink),
            CancellationToken::new(),
        ))
    }

    fn east() -> ClusterRef {
        ObjectKey::cluster("fleet", "east", ClusterType::Managed)
    }

    fn prod_labels() -> Labels {
        Labels::from([("env".to_string(), "prod".to_string())])
    }

    #[tokio::test]
    async fn test_invalid_selector_is_surfaced_on_status() {
        let policy = Arc::new(Mutex::new(stored_policy(
            "env in (prod",
            HealthPolicyStatus {
                matching_clusters: vec![east()],
                cluster_conditions: Vec::new(),
                failure_message: None,
            },
        )));
        let engine = engine(
            shared_store(&policy),
            MockAddonStatusSource::new(),
            MockNotificationSink::new(),
        );
        engine.cluster_changed(&east(), prod_labels());

        let current = policy.lock().unwrap().clone();
        let action = engine.reconcile_policy(&current).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = policy.lock().unwrap().status.clone().unwrap();
        assert!(status.failure_message.is_some());
        assert!(status.matching_clusters.is_empty());
    }

    #[tokio::test]
    async fn test_other_shard_is_ignored() {
        let mut store = MockPolicyStore::new();
        store.expect_replace_status().never();
        let engine = engine(store, MockAddonStatusSource::new(), MockNotificationSink::new());

        let mut policy = stored_policy("env=prod", HealthPolicyStatus::default());
        policy.spec.shard_key = Some("shard-b".to_string());

        let action = engine.reconcile_policy(&policy).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_missing_cluster_is_dropped() {
        let policy = Arc::new(Mutex::new(stored_policy("env=prod", HealthPolicyStatus::default())));
        let mut store = MockPolicyStore::new();
        let read = Arc::clone(&policy);
        store
            .expect_get_policy()
            .returning(move |_| Ok(Some(read.lock().unwrap().clone())));
        let write = Arc::clone(&policy);
        store.expect_replace_status().returning(move |updated| {
            write.lock().unwrap().status.clone_from(&updated.status);
            Ok(())
        });
        store
            .expect_cluster_presence()
            .returning(|_| Ok(ClusterPresence::Missing));

        let engine = engine(store, MockAddonStatusSource::new(), MockNotificationSink::new());
        engine.cluster_changed(&east(), prod_labels());

        let current = policy.lock().unwrap().clone();
        engine.reconcile_policy(&current).await.unwrap();

        assert!(!engine.index().knows_cluster(&east()));
        let status = policy.lock().unwrap().status.clone().unwrap();
        assert!(status.matching_clusters.is_empty());
        assert!(status.cluster_conditions.is_empty());
    }

    #[tokio::test]
    async fn test_process_cluster_merges_and_notifies() {
        let policy = Arc::new(Mutex::new(stored_policy(
            "env=prod",
            HealthPolicyStatus {
                matching_clusters: vec![east()],
                cluster_conditions: vec![crate::crds::ClusterCondition::pending(east())],
                failure_message: None,
            },
        )));

        let mut addons = MockAddonStatusSource::new();
        addons.expect_addon_status().returning(|_, _| {
            Ok(vec![FeatureSummary {
                feature_id: "cni".to_string(),
                status: FeatureStatus::Provisioned,
                failure_message: None,
            }])
        });
        let mut sink = MockNotificationSink::new();
        sink.expect_deliver()
            .withf(|notification, _, event| notification.name == "event" && event.passing)
            .times(1)
            .returning(|_, _, _| DeliveryOutcome::Delivered);

        let engine = engine(shared_store(&policy), addons, sink);
        register_prod(&engine);
        engine.cluster_changed(&east(), prod_labels());

        engine.process_cluster(&east(), &ObjectKey::policy("prod")).await.unwrap();

        let status = policy.lock().unwrap().status.clone().unwrap();
        let entry = &status.cluster_conditions[0];
        assert_eq!(entry.state, EvaluationState::Evaluated);
        assert_eq!(entry.conditions[0].condition_type, "Addons-core");
        assert_eq!(entry.conditions[0].status, ConditionStatus::True);
        assert_eq!(entry.notification_summaries[0].status, NotificationStatus::Delivered);
    }

    #[tokio::test]
    async fn test_process_cluster_skips_unmatched_cluster() {
        let policy = Arc::new(Mutex::new(stored_policy("env=prod", HealthPolicyStatus::default())));
        let mut addons = MockAddonStatusSource::new();
        addons.expect_addon_status().never();

        let engine = engine(shared_store(&policy), addons, MockNotificationSink::new());
        engine.cluster_changed(
            &east(),
            Labels::from([("env".to_string(), "dev".to_string())]),
        );

        engine.process_cluster(&east(), &ObjectKey::policy("prod")).await.unwrap();
        assert_eq!(policy.lock().unwrap().status, Some(HealthPolicyStatus::default()));
    }

    #[test]
    fn test_report_changed_targets_intersection() {
        let engine = engine(
            MockPolicyStore::new(),
            MockAddonStatusSource::new(),
            MockNotificationSink::new(),
        );
        let with_check = ObjectKey::policy("with-check");
        let without_check = ObjectKey::policy("without-check");
        engine
            .index()
            .update_policy(
                &with_check,
                PolicyRegistration {
                    selector: "env=prod".to_string(),
                    shard_key: None,
                    health_definitions: vec!["deployments".to_string()],
                },
            )
            .unwrap();
        engine
            .index()
            .update_policy(
                &without_check,
                PolicyRegistration {
                    selector: "env=prod".to_string(),
                    shard_key: None,
                    health_definitions: Vec::new(),
                },
            )
            .unwrap();
        engine.cluster_changed(&east(), prod_labels());

        let affected =
            engine.report_changed(&ObjectKey::health_definition("deployments"), &east());
        assert_eq!(affected.items(), vec![with_check]);
    }

    fn register_prod(engine: &Engine) {
        engine
            .index()
            .update_policy(
                &ObjectKey::policy("prod"),
                PolicyRegistration {
                    selector: "env=prod".to_string(),
                    shard_key: None,
                    health_definitions: Vec::new(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_presence_lookup_is_cached_until_cluster_event() {
        let policy = Arc::new(Mutex::new(stored_policy("env=prod", HealthPolicyStatus::default())));
        let mut store = MockPolicyStore::new();
        let read = Arc::clone(&policy);
        store
            .expect_get_policy()
            .returning(move |_| Ok(Some(read.lock().unwrap().clone())));
        let write = Arc::clone(&policy);
        store.expect_replace_status().returning(move |updated| {
            write.lock().unwrap().status.clone_from(&updated.status);
            Ok(())
        });
        store
            .expect_cluster_presence()
            .times(2)
            .returning(|_| Ok(ClusterPresence::Paused));

        let engine = engine(store, MockAddonStatusSource::new(), MockNotificationSink::new());
        engine.cluster_changed(&east(), prod_labels());

        for _ in 0..3 {
            let current = policy.lock().unwrap().clone();
            engine.reconcile_policy(&current).await.unwrap();
        }

        // A watch event on the cluster forces a fresh lookup
        engine.cluster_changed(&east(), prod_labels());
        let current = policy.lock().unwrap().clone();
        engine.reconcile_policy(&current).await.unwrap();

        let status = policy.lock().unwrap().status.clone().unwrap();
        assert_eq!(status.matching_clusters, vec![east()]);
    }

    #[tokio::test]
    async fn test_relabeled_cluster_releases_its_job_state() {
        let engine = engine(
            MockPolicyStore::new(),
            MockAddonStatusSource::new(),
            MockNotificationSink::new(),
        );
        let prod = ObjectKey::policy("prod");
        register_prod(&engine);
        engine.cluster_changed(&east(), prod_labels());

        engine.dispatcher.ensure_job(&east(), &prod, FEATURE, async {
            Err(Error::Evaluation("cluster unreachable".to_string()))
        });
        while engine.dispatcher.is_in_progress(&east(), &prod, FEATURE) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        engine.schedule.dispatched(&prod, &east());
        assert!(!engine.schedule.is_due(&prod, &east()));

        let affected = engine.cluster_changed(
            &east(),
            Labels::from([("env".to_string(), "dev".to_string())]),
        );
        assert!(affected.has(&prod));
        assert_eq!(engine.dispatcher.poll(&east(), &prod, FEATURE), DispatchState::Idle);
        assert!(engine.schedule.is_due(&prod, &east()));
    }
}
