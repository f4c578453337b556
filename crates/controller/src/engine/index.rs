//! Selector index.
//!
//! Keeps, for every `HealthPolicy`, the set of clusters it selects and the
//! reverse cluster → policies map, plus the `HealthDefinition` → policies
//! lookup used to re-trigger only the policies that reference an edited
//! definition. All maps live in one struct behind one mutex and are only ever
//! mutated together, so a reader never sees a policy in `policy_to_clusters`
//! that is missing from the matching `cluster_to_policies` entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

use super::selector::{Selector, SelectorError};
use super::set::{ClusterRef, HealthDefRef, ObjectKey, ObjectSet, PolicyRef};

pub type Labels = BTreeMap<String, String>;

/// Index maps disagree with each other. Never expected at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InconsistentIndex {
    #[error("{policy} lists {cluster} but the cluster does not list the policy")]
    MissingReverse { policy: String, cluster: String },

    #[error("{cluster} lists {policy} but the policy does not list the cluster")]
    MissingForward { policy: String, cluster: String },

    #[error("{definition} lists {policy} but the policy does not reference it")]
    StaleHealthDefinition { policy: String, definition: String },
}

/// Selector-relevant view of a policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRegistration {
    pub selector: String,
    pub shard_key: Option<String>,
    pub health_definitions: Vec<String>,
}

/// Match set change produced by `update_policy`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexUpdate {
    pub matches: ObjectSet,
    pub added: ObjectSet,
    pub removed: ObjectSet,
}

#[derive(Debug, Clone)]
struct PolicyEntry {
    registration: PolicyRegistration,
    // `None` when the expression failed to parse: the policy matches nothing
    selector: Option<Selector>,
    health_definitions: ObjectSet,
}

#[derive(Debug, Default)]
struct IndexState {
    cluster_labels: HashMap<ClusterRef, Labels>,
    policies: HashMap<PolicyRef, PolicyEntry>,
    cluster_to_policies: HashMap<ClusterRef, ObjectSet>,
    policy_to_clusters: HashMap<PolicyRef, ObjectSet>,
    health_def_to_policies: HashMap<HealthDefRef, ObjectSet>,
}

/// Cluster/policy/definition index shared by the watch mappers and the driver
#[derive(Debug, Default)]
pub struct SelectorIndex {
    shard_key: Option<String>,
    state: Mutex<IndexState>,
}

impl SelectorIndex {
    /// Index for a replica owning `shard_key` (`None` or empty: unsharded replica)
    #[must_use]
    pub fn new(shard_key: Option<String>) -> Self {
        Self {
            shard_key: shard_key.filter(|key| !key.is_empty()),
            state: Mutex::new(IndexState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this replica owns policies carrying `shard_key`
    #[must_use]
    pub fn owns_shard(&self, shard_key: Option<&str>) -> bool {
        match shard_key.filter(|key| !key.is_empty()) {
            None => true,
            Some(key) => self.shard_key.as_deref() == Some(key),
        }
    }

    /// Register or refresh a policy and recompute its matches against every
    /// known cluster.
    ///
    /// # Errors
    /// A malformed selector is returned after the policy has been registered
    /// with zero matches, so callers can surface it on the policy.
    pub fn update_policy(
        &self,
        policy: &PolicyRef,
        registration: PolicyRegistration,
    ) -> Result<IndexUpdate, SelectorError> {
        let parsed = Selector::parse(&registration.selector);
        let owned = self.owns_shard(registration.shard_key.as_deref());

        let mut state = self.lock();

        let unchanged = state
            .policies
            .get(policy)
            .is_some_and(|entry| entry.registration == registration);
        if unchanged {
            let matches = state.policy_to_clusters.get(policy).cloned().unwrap_or_default();
            return parsed.map(|_| IndexUpdate {
                matches,
                ..IndexUpdate::default()
            });
        }

        let health_definitions: ObjectSet = registration
            .health_definitions
            .iter()
            .map(|name| ObjectKey::health_definition(name))
            .collect();

        let selector = parsed.as_ref().ok().cloned();
        let matches: ObjectSet = match (&selector, owned) {
            (Some(selector), true) => state
                .cluster_labels
                .iter()
                .filter(|(_, labels)| selector.matches(labels))
                .map(|(cluster, _)| cluster.clone())
                .collect(),
            _ => ObjectSet::new(),
        };

        let previous = state.policy_to_clusters.get(policy).cloned().unwrap_or_default();
        let previous_defs = state
            .policies
            .get(policy)
            .map(|entry| entry.health_definitions.clone())
            .unwrap_or_default();

        state.set_policy_matches(policy, &previous, &matches);
        state.set_policy_health_definitions(policy, &previous_defs, &health_definitions);
        state.policies.insert(
            policy.clone(),
            PolicyEntry {
                registration,
                selector,
                health_definitions,
            },
        );
        debug_assert!(state.check().is_ok(), "selector index desync");

        let update = IndexUpdate {
            added: matches.difference(&previous),
            removed: previous.difference(&matches),
            matches,
        };
        debug!(
            policy = %policy,
            matches = update.matches.len(),
            added = update.added.len(),
            removed = update.removed.len(),
            "Recomputed policy matches"
        );

        parsed.map(|_| update)
    }

    /// Forget a policy; returns the clusters it was matching
    pub fn remove_policy(&self, policy: &PolicyRef) -> ObjectSet {
        let mut state = self.lock();

        let previous = state.policy_to_clusters.get(policy).cloned().unwrap_or_default();
        state.set_policy_matches(policy, &previous, &ObjectSet::new());
        state.policy_to_clusters.remove(policy);

        if let Some(entry) = state.policies.remove(policy) {
            state.set_policy_health_definitions(policy, &entry.health_definitions, &ObjectSet::new());
        }
        debug_assert!(state.check().is_ok(), "selector index desync");

        previous
    }

    /// Record a cluster's labels and recompute which policies select it.
    ///
    /// Returns every policy whose match set may have changed: the policies
    /// matching before the update together with those matching after it.
    pub fn update_cluster_labels(&self, cluster: &ClusterRef, labels: Labels) -> ObjectSet {
        let mut state = self.lock();

        let previous = state.cluster_to_policies.get(cluster).cloned().unwrap_or_default();
        if state.cluster_labels.get(cluster) == Some(&labels) {
            return previous;
        }

        let current: ObjectSet = state
            .policies
            .iter()
            .filter(|(_, entry)| {
                self.owns_shard(entry.registration.shard_key.as_deref())
                    && entry.selector.as_ref().is_some_and(|s| s.matches(&labels))
            })
            .map(|(policy, _)| policy.clone())
            .collect();

        state.cluster_labels.insert(cluster.clone(), labels);
        state.set_cluster_matches(cluster, &previous, &current);
        debug_assert!(state.check().is_ok(), "selector index desync");

        previous.union(&current)
    }

    /// Forget a cluster; returns the policies that were selecting it
    pub fn remove_cluster(&self, cluster: &ClusterRef) -> ObjectSet {
        let mut state = self.lock();

        let previous = state.cluster_to_policies.get(cluster).cloned().unwrap_or_default();
        state.set_cluster_matches(cluster, &previous, &ObjectSet::new());
        state.cluster_labels.remove(cluster);
        debug_assert!(state.check().is_ok(), "selector index desync");

        previous
    }

    #[must_use]
    pub fn matches_for_policy(&self, policy: &PolicyRef) -> ObjectSet {
        self.lock().policy_to_clusters.get(policy).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn policies_for_cluster(&self, cluster: &ClusterRef) -> ObjectSet {
        self.lock().cluster_to_policies.get(cluster).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn policies_for_health_definition(&self, definition: &HealthDefRef) -> ObjectSet {
        self.lock()
            .health_def_to_policies
            .get(definition)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the cluster has been seen and not removed
    #[must_use]
    pub fn knows_cluster(&self, cluster: &ClusterRef) -> bool {
        self.lock().cluster_labels.contains_key(cluster)
    }

    /// Check that the forward and reverse maps are exact inverses
    ///
    /// # Errors
    /// Describes the first asymmetry found.
    pub fn verify_consistency(&self) -> Result<(), InconsistentIndex> {
        self.lock().check()
    }
}

impl IndexState {
    fn set_policy_matches(&mut self, policy: &PolicyRef, previous: &ObjectSet, current: &ObjectSet) {
        for cluster in previous.difference(current) {
            self.unlink(policy, &cluster);
        }
        for cluster in current.difference(previous) {
            self.link(policy, &cluster);
        }
        self.policy_to_clusters
            .entry(policy.clone())
            .or_default();
    }

    fn set_cluster_matches(
        &mut self,
        cluster: &ClusterRef,
        previous: &ObjectSet,
        current: &ObjectSet,
    ) {
        for policy in previous.difference(current) {
            self.unlink(&policy, cluster);
        }
        for policy in current.difference(previous) {
            self.link(&policy, cluster);
        }
    }

    fn link(&mut self, policy: &PolicyRef, cluster: &ClusterRef) {
        self.policy_to_clusters
            .entry(policy.clone())
            .or_default()
            .insert(cluster.clone());
        self.cluster_to_policies
            .entry(cluster.clone())
            .or_default()
            .insert(policy.clone());
    }

    fn unlink(&mut self, policy: &PolicyRef, cluster: &ClusterRef) {
        if let Some(clusters) = self.policy_to_clusters.get_mut(policy) {
            clusters.erase(cluster);
        }
        if let Some(policies) = self.cluster_to_policies.get_mut(cluster) {
            policies.erase(policy);
            if policies.is_empty() {
                self.cluster_to_policies.remove(cluster);
            }
        }
    }

    fn set_policy_health_definitions(
        &mut self,
        policy: &PolicyRef,
        previous: &ObjectSet,
        current: &ObjectSet,
    ) {
        for definition in previous.difference(current) {
            if let Some(policies) = self.health_def_to_policies.get_mut(&definition) {
                policies.erase(policy);
                if policies.is_empty() {
                    self.health_def_to_policies.remove(&definition);
                }
            }
        }
        for definition in current.difference(previous) {
            self.health_def_to_policies
                .entry(definition)
                .or_default()
                .insert(policy.clone());
        }
    }

    fn check(&self) -> Result<(), InconsistentIndex> {
        for (policy, clusters) in &self.policy_to_clusters {
            for cluster in clusters {
                let listed = self
                    .cluster_to_policies
                    .get(cluster)
                    .is_some_and(|policies| policies.has(policy));
                if !listed {
                    return Err(InconsistentIndex::MissingReverse {
                        policy: policy.to_string(),
                        cluster: cluster.to_string(),
                    });
                }
            }
        }

        for (cluster, policies) in &self.cluster_to_policies {
            for policy in policies {
                let listed = self
                    .policy_to_clusters
                    .get(policy)
                    .is_some_and(|clusters| clusters.has(cluster));
                if !listed {
                    return Err(InconsistentIndex::MissingForward {
                        policy: policy.to_string(),
                        cluster: cluster.to_string(),
                    });
                }
            }
        }

        for (definition, policies) in &self.health_def_to_policies {
            for policy in policies {
                let referenced = self
                    .policies
                    .get(policy)
                    .is_some_and(|entry| entry.health_definitions.has(definition));
                if !referenced {
                    return Err(InconsistentIndex::StaleHealthDefinition {
                        policy: policy.to_string(),
                        definition: definition.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::ClusterType;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn registration(selector: &str) -> PolicyRegistration {
        PolicyRegistration {
            selector: selector.to_string(),
            ..PolicyRegistration::default()
        }
    }

    fn cluster(name: &str) -> ClusterRef {
        ObjectKey::cluster("fleet", name, ClusterType::Managed)
    }

    #[test]
    fn test_env_prod_scenario() {
        let index = SelectorIndex::new(None);
        let policy = ObjectKey::policy("prod-health");
        let a = cluster("a");
        let b = cluster("b");

        index.update_cluster_labels(&a, labels(&[("env", "prod")]));
        index.update_cluster_labels(&b, labels(&[("env", "dev")]));
        index.update_policy(&policy, registration("env=prod")).unwrap();

        assert_eq!(index.matches_for_policy(&policy).items(), vec![a.clone()]);

        let affected = index.update_cluster_labels(&b, labels(&[("env", "prod")]));
        assert!(affected.has(&policy));
        assert_eq!(index.matches_for_policy(&policy).items(), vec![a, b.clone()]);
        assert!(index.policies_for_cluster(&b).has(&policy));
        index.verify_consistency().unwrap();
    }

    #[test]
    fn test_update_order_does_not_matter() {
        let policy = ObjectKey::policy("p");
        let clusters = [
            (cluster("a"), labels(&[("env", "prod"), ("tier", "gold")])),
            (cluster("b"), labels(&[("env", "prod")])),
            (cluster("c"), labels(&[("tier", "gold")])),
        ];

        let policy_first = SelectorIndex::new(None);
        policy_first
            .update_policy(&policy, registration("env=prod,tier in (gold)"))
            .unwrap();
        for (key, l) in &clusters {
            policy_first.update_cluster_labels(key, l.clone());
        }

        let clusters_first = SelectorIndex::new(None);
        for (key, l) in clusters.iter().rev() {
            clusters_first.update_cluster_labels(key, l.clone());
        }
        clusters_first
            .update_policy(&policy, registration("env=prod,tier in (gold)"))
            .unwrap();

        let expected = vec![cluster("a")];
        assert_eq!(policy_first.matches_for_policy(&policy).items(), expected);
        assert_eq!(clusters_first.matches_for_policy(&policy).items(), expected);
        policy_first.verify_consistency().unwrap();
        clusters_first.verify_consistency().unwrap();
    }

    #[test]
    fn test_selector_change_reports_added_and_removed() {
        let index = SelectorIndex::new(None);
        let policy = ObjectKey::policy("p");
        index.update_cluster_labels(&cluster("a"), labels(&[("env", "prod")]));
        index.update_cluster_labels(&cluster("b"), labels(&[("env", "dev")]));

        let first = index.update_policy(&policy, registration("env=prod")).unwrap();
        assert_eq!(first.added.items(), vec![cluster("a")]);
        assert!(first.removed.is_empty());

        let second = index.update_policy(&policy, registration("env=dev")).unwrap();
        assert_eq!(second.added.items(), vec![cluster("b")]);
        assert_eq!(second.removed.items(), vec![cluster("a")]);
        assert!(index.policies_for_cluster(&cluster("a")).is_empty());
        index.verify_consistency().unwrap();
    }

    #[test]
    fn test_malformed_selector_matches_nothing() {
        let index = SelectorIndex::new(None);
        let policy = ObjectKey::policy("p");
        index.update_cluster_labels(&cluster("a"), labels(&[("env", "prod")]));
        index.update_policy(&policy, registration("env=prod")).unwrap();
        assert_eq!(index.matches_for_policy(&policy).len(), 1);

        let err = index.update_policy(&policy, registration("env in (prod")).unwrap_err();
        assert!(matches!(err, SelectorError::MalformedSet(_)));
        assert!(index.matches_for_policy(&policy).is_empty());
        assert!(index.policies_for_cluster(&cluster("a")).is_empty());

        // Re-submitting the same broken policy still reports the error
        assert!(index.update_policy(&policy, registration("env in (prod")).is_err());
        index.verify_consistency().unwrap();
    }

    #[test]
    fn test_shard_ownership() {
        let index = SelectorIndex::new(Some("shard-a".to_string()));
        index.update_cluster_labels(&cluster("a"), labels(&[("env", "prod")]));

        let mine = ObjectKey::policy("mine");
        let theirs = ObjectKey::policy("theirs");
        let unsharded = ObjectKey::policy("unsharded");

        let mut owned = registration("env=prod");
        owned.shard_key = Some("shard-a".to_string());
        let mut foreign = registration("env=prod");
        foreign.shard_key = Some("shard-b".to_string());

        index.update_policy(&mine, owned).unwrap();
        index.update_policy(&theirs, foreign).unwrap();
        index.update_policy(&unsharded, registration("env=prod")).unwrap();

        let policies = index.policies_for_cluster(&cluster("a"));
        assert!(policies.has(&mine));
        assert!(!policies.has(&theirs));
        assert!(policies.has(&unsharded));

        let unsharded_replica = SelectorIndex::new(Some(String::new()));
        assert!(unsharded_replica.owns_shard(None));
        assert!(!unsharded_replica.owns_shard(Some("shard-a")));
    }

    #[test]
    fn test_remove_cluster_and_policy() {
        let index = SelectorIndex::new(None);
        let p1 = ObjectKey::policy("p1");
        let p2 = ObjectKey::policy("p2");
        let a = cluster("a");

        index.update_cluster_labels(&a, labels(&[("env", "prod")]));
        index.update_policy(&p1, registration("env")).unwrap();
        index.update_policy(&p2, registration("env=prod")).unwrap();

        let removed_from = index.remove_cluster(&a);
        assert_eq!(removed_from.items(), vec![p1.clone(), p2.clone()]);
        assert!(index.matches_for_policy(&p1).is_empty());
        assert!(!index.knows_cluster(&a));

        index.update_cluster_labels(&a, labels(&[("env", "prod")]));
        let was_matching = index.remove_policy(&p1);
        assert_eq!(was_matching.items(), vec![a.clone()]);
        assert_eq!(index.policies_for_cluster(&a).items(), vec![p2]);
        index.verify_consistency().unwrap();
    }

    #[test]
    fn test_health_definition_reverse_lookup() {
        let index = SelectorIndex::new(None);
        let policy = ObjectKey::policy("p");
        let replicas = ObjectKey::health_definition("replicas");
        let pods = ObjectKey::health_definition("pods");

        let mut with_defs = registration("env=prod");
        with_defs.health_definitions = vec!["replicas".to_string(), "pods".to_string()];
        index.update_policy(&policy, with_defs).unwrap();
        assert!(index.policies_for_health_definition(&replicas).has(&policy));
        assert!(index.policies_for_health_definition(&pods).has(&policy));

        let mut fewer = registration("env=prod");
        fewer.health_definitions = vec!["pods".to_string()];
        index.update_policy(&policy, fewer).unwrap();
        assert!(index.policies_for_health_definition(&replicas).is_empty());

        index.remove_policy(&policy);
        assert!(index.policies_for_health_definition(&pods).is_empty());
        index.verify_consistency().unwrap();
    }

    #[test]
    fn test_unchanged_labels_report_current_policies() {
        let index = SelectorIndex::new(None);
        let policy = ObjectKey::policy("p");
        let a = cluster("a");
        index.update_policy(&policy, registration("env=prod")).unwrap();

        let first = index.update_cluster_labels(&a, labels(&[("env", "prod")]));
        let again = index.update_cluster_labels(&a, labels(&[("env", "prod")]));
        assert_eq!(first, again);

        // Dropping out of the selector still reports the old policy
        let dropped = index.update_cluster_labels(&a, labels(&[("env", "dev")]));
        assert!(dropped.has(&policy));
        assert!(index.matches_for_policy(&policy).is_empty());
    }
}
