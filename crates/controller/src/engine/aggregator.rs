//! Merging evaluation results into a `HealthPolicy` status.
//!
//! Every function here edits exactly one cluster entry of the status and
//! leaves the position and content of all other entries untouched.

use tracing::debug;

use super::set::{ClusterRef, ObjectSet};
use crate::crds::{
    ClusterCondition, Condition, EvaluationState, HealthPolicyStatus, Notification,
    NotificationStatus, NotificationSummary,
};

/// Where a cluster stands in a policy status.
///
/// An absent entry is `Removed`; a freshly matched cluster carries an explicit
/// `NotYetEvaluated` entry until its first merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEntryState {
    NotYetEvaluated,
    Evaluated,
    Removed,
}

/// Result of one notification delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

fn find_entry<'a>(
    status: &'a HealthPolicyStatus,
    cluster: &ClusterRef,
) -> Option<&'a ClusterCondition> {
    status.cluster_conditions.iter().find(|c| &c.cluster == cluster)
}

fn find_entry_mut<'a>(
    status: &'a mut HealthPolicyStatus,
    cluster: &ClusterRef,
) -> Option<&'a mut ClusterCondition> {
    status
        .cluster_conditions
        .iter_mut()
        .find(|c| &c.cluster == cluster)
}

fn entry_or_insert<'a>(
    status: &'a mut HealthPolicyStatus,
    cluster: &ClusterRef,
) -> &'a mut ClusterCondition {
    let position = match status
        .cluster_conditions
        .iter()
        .position(|c| &c.cluster == cluster)
    {
        Some(position) => position,
        None => {
            status
                .cluster_conditions
                .push(ClusterCondition::pending(cluster.clone()));
            status.cluster_conditions.len() - 1
        }
    };
    &mut status.cluster_conditions[position]
}

#[must_use]
pub fn cluster_entry_state(status: &HealthPolicyStatus, cluster: &ClusterRef) -> ClusterEntryState {
    match find_entry(status, cluster).map(|entry| entry.state) {
        None => ClusterEntryState::Removed,
        Some(EvaluationState::NotYetEvaluated) => ClusterEntryState::NotYetEvaluated,
        Some(EvaluationState::Evaluated) => ClusterEntryState::Evaluated,
    }
}

#[must_use]
pub fn is_cluster_entry_removed(status: &HealthPolicyStatus, cluster: &ClusterRef) -> bool {
    cluster_entry_state(status, cluster) == ClusterEntryState::Removed
}

/// Append a `NotYetEvaluated` entry for a newly matched cluster.
/// Returns `false` when the cluster already has an entry.
pub fn ensure_cluster_entry(status: &mut HealthPolicyStatus, cluster: &ClusterRef) -> bool {
    if find_entry(status, cluster).is_some() {
        return false;
    }
    status
        .cluster_conditions
        .push(ClusterCondition::pending(cluster.clone()));
    true
}

/// Delete the entry for `cluster`. Only an exact key match is removed, so a
/// cluster of another type sharing namespace and name keeps its entry.
pub fn remove_cluster_entry(status: &mut HealthPolicyStatus, cluster: &ClusterRef) -> bool {
    let before = status.cluster_conditions.len();
    status.cluster_conditions.retain(|c| &c.cluster != cluster);
    before != status.cluster_conditions.len()
}

/// Drop entries for clusters outside `matching`; returns the dropped clusters
pub fn prune_cluster_entries(status: &mut HealthPolicyStatus, matching: &ObjectSet) -> Vec<ClusterRef> {
    let mut pruned = Vec::new();
    status.cluster_conditions.retain(|c| {
        let keep = matching.has(&c.cluster);
        if !keep {
            pruned.push(c.cluster.clone());
        }
        keep
    });
    pruned
}

/// Replace the condition list of one cluster, creating its entry if needed
pub fn update_conditions(status: &mut HealthPolicyStatus, cluster: &ClusterRef, conditions: Vec<Condition>) {
    let entry = entry_or_insert(status, cluster);
    entry.conditions = conditions;
    entry.state = EvaluationState::Evaluated;
}

/// Replace the notification summaries of one cluster, creating its entry if needed
pub fn update_notification_summaries(
    status: &mut HealthPolicyStatus,
    cluster: &ClusterRef,
    summaries: Vec<NotificationSummary>,
) {
    entry_or_insert(status, cluster).notification_summaries = summaries;
}

/// Record (or clear) the dispatch failure shown on a cluster entry.
/// Returns `false` when the cluster has no entry.
pub fn set_failure_message(
    status: &mut HealthPolicyStatus,
    cluster: &ClusterRef,
    message: Option<String>,
) -> bool {
    match find_entry_mut(status, cluster) {
        Some(entry) => {
            entry.failure_message = message;
            true
        }
        None => false,
    }
}

/// Merge a freshly evaluated condition list for `cluster`.
///
/// The conditions replace the previous list wholesale. Returns the names of
/// the notifications due for delivery:
/// * not passing: none;
/// * passing after not passing (or first evaluation): all, reset to `Pending`;
/// * still passing: those `Pending` or `Failed`, and newly configured ones.
///
/// Summaries of notifications that are no longer configured are dropped.
pub fn merge(
    status: &mut HealthPolicyStatus,
    cluster: &ClusterRef,
    conditions: Vec<Condition>,
    passing: bool,
    notifications: &[Notification],
) -> Vec<String> {
    let entry = entry_or_insert(status, cluster);
    let was_passing = entry.is_passing();

    entry.conditions = conditions;
    entry.state = EvaluationState::Evaluated;
    entry.failure_message = None;
    entry
        .notification_summaries
        .retain(|s| notifications.iter().any(|n| n.name == s.name));

    if !passing {
        debug!(cluster = %cluster, "Cluster not passing, no notification due");
        return Vec::new();
    }

    let mut summaries = Vec::with_capacity(notifications.len());
    let mut due = Vec::new();
    for notification in notifications {
        let previous = entry
            .notification_summaries
            .iter()
            .find(|s| s.name == notification.name)
            .filter(|_| was_passing);

        let summary = match previous {
            Some(summary) => summary.clone(),
            None => NotificationSummary {
                name: notification.name.clone(),
                status: NotificationStatus::Pending,
                failure_message: None,
            },
        };
        if summary.status != NotificationStatus::Delivered {
            due.push(notification.name.clone());
        }
        summaries.push(summary);
    }
    entry.notification_summaries = summaries;

    debug!(
        cluster = %cluster,
        became_passing = !was_passing,
        due = due.len(),
        "Merged cluster conditions"
    );
    due
}

/// Record the outcome of delivering `notification` for `cluster`.
/// Returns `false` when there is no summary to update.
pub fn record_delivery(
    status: &mut HealthPolicyStatus,
    cluster: &ClusterRef,
    notification: &str,
    outcome: &DeliveryOutcome,
) -> bool {
    let Some(summary) = find_entry_mut(status, cluster).and_then(|entry| {
        entry
            .notification_summaries
            .iter_mut()
            .find(|s| s.name == notification)
    }) else {
        return false;
    };

    match outcome {
        DeliveryOutcome::Delivered => {
            summary.status = NotificationStatus::Delivered;
            summary.failure_message = None;
        }
        DeliveryOutcome::Failed(reason) => {
            summary.status = NotificationStatus::Failed;
            summary.failure_message = Some(reason.clone());
        }
    }
    true
}
