//! Decides when a (policy, cluster) pair is due for another evaluation.
//!
//! Status writes made by evaluation jobs re-trigger the policy reconcile, so
//! dispatching on every reconcile would evaluate in a tight loop. A pair is
//! dispatched when something it depends on changed, when it was never
//! evaluated, or when the periodic interval has elapsed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::store::ClusterPresence;
use crate::engine::set::{ClusterRef, PolicyRef};

/// When a pair was last dispatched and which policy mark it had seen
#[derive(Debug, Clone, Copy)]
struct Dispatch {
    at: Instant,
    epoch: u64,
}

#[derive(Debug, Default)]
struct ScheduleState {
    dirty_pairs: HashSet<(PolicyRef, ClusterRef)>,
    // Bumped by every policy-wide mark; a pair dispatched under an older
    // epoch is due again
    policy_epochs: HashMap<PolicyRef, u64>,
    last_dispatch: HashMap<(PolicyRef, ClusterRef), Dispatch>,
    generations: HashMap<PolicyRef, i64>,
    presence: HashMap<ClusterRef, (ClusterPresence, Instant)>,
}

impl ScheduleState {
    fn epoch(&self, policy: &PolicyRef) -> u64 {
        self.policy_epochs.get(policy).copied().unwrap_or_default()
    }

    fn bump(&mut self, policy: &PolicyRef) {
        *self.policy_epochs.entry(policy.clone()).or_default() += 1;
    }
}

#[derive(Debug)]
pub struct EvaluationSchedule {
    interval: Duration,
    state: Mutex<ScheduleState>,
}

impl EvaluationSchedule {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(ScheduleState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Something `cluster` reports changed for `policy`
    pub fn mark_pair(&self, policy: &PolicyRef, cluster: &ClusterRef) {
        self.lock()
            .dirty_pairs
            .insert((policy.clone(), cluster.clone()));
    }

    /// Every cluster of `policy` needs a fresh evaluation
    pub fn mark_policy(&self, policy: &PolicyRef) {
        self.lock().bump(policy);
    }

    /// Record the observed spec generation; a change marks the whole policy
    pub fn observe_generation(&self, policy: &PolicyRef, generation: Option<i64>) {
        let Some(generation) = generation else {
            return;
        };
        let mut state = self.lock();
        let previous = state.generations.insert(policy.clone(), generation);
        if previous.is_some_and(|previous| previous != generation) {
            state.bump(policy);
        }
    }

    #[must_use]
    pub fn is_due(&self, policy: &PolicyRef, cluster: &ClusterRef) -> bool {
        let state = self.lock();
        let pair = (policy.clone(), cluster.clone());
        if state.dirty_pairs.contains(&pair) {
            return true;
        }
        let epoch = state.epoch(policy);
        state.last_dispatch.get(&pair).map_or(true, |last| {
            last.epoch < epoch || last.at.elapsed() >= self.interval
        })
    }

    /// A job for the pair was queued; clears its marks
    pub fn dispatched(&self, policy: &PolicyRef, cluster: &ClusterRef) {
        let mut state = self.lock();
        let pair = (policy.clone(), cluster.clone());
        let epoch = state.epoch(policy);
        state.dirty_pairs.remove(&pair);
        state.last_dispatch.insert(
            pair,
            Dispatch {
                at: Instant::now(),
                epoch,
            },
        );
    }

    /// Presence of `cluster` looked up within the last interval, if any
    #[must_use]
    pub fn cached_presence(&self, cluster: &ClusterRef) -> Option<ClusterPresence> {
        self.lock()
            .presence
            .get(cluster)
            .filter(|(_, at)| at.elapsed() < self.interval)
            .map(|(presence, _)| *presence)
    }

    pub fn record_presence(&self, cluster: &ClusterRef, presence: ClusterPresence) {
        self.lock()
            .presence
            .insert(cluster.clone(), (presence, Instant::now()));
    }

    /// Drop the cached presence; the next reconcile asks the store again
    pub fn invalidate_presence(&self, cluster: &ClusterRef) {
        self.lock().presence.remove(cluster);
    }

    /// Forget a pair whose cluster stopped matching
    pub fn forget_pair(&self, policy: &PolicyRef, cluster: &ClusterRef) {
        let mut state = self.lock();
        let pair = (policy.clone(), cluster.clone());
        state.dirty_pairs.remove(&pair);
        state.last_dispatch.remove(&pair);
    }

    /// Forget a deleted cluster's cached presence
    pub fn forget_cluster(&self, cluster: &ClusterRef) {
        self.lock().presence.remove(cluster);
    }

    /// Forget everything about a deleted policy
    pub fn forget_policy(&self, policy: &PolicyRef) {
        let mut state = self.lock();
        state.dirty_pairs.retain(|(p, _)| p != policy);
        state.last_dispatch.retain(|(p, _), _| p != policy);
        state.policy_epochs.remove(policy);
        state.generations.remove(policy);
    }
}
