//! Liveness evaluation for one (cluster, policy) pair.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, instrument, warn};

use super::set::{ClusterRef, HealthDefRef, ObjectKey, PolicyRef};
use crate::crds::{
    Condition, ConditionStatus, FeatureStatus, FeatureSummary, HealthPolicySpec, HealthReportSpec,
    LivenessCheck, LivenessType,
};
use crate::error::{Error, Result};

/// Unhealthy resources listed in a condition message before truncating
const MAX_REPORTED_RESOURCES: usize = 5;

/// Add-on provisioning state of a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AddonStatusSource: Send + Sync {
    /// Feature summaries of every add-on profile deployed to `cluster`
    async fn addon_status(&self, cluster: &ClusterRef, policy: &PolicyRef) -> Result<Vec<FeatureSummary>>;
}

/// Health reports collected from managed clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthReportSource: Send + Sync {
    /// Latest report for `definition` in `cluster`; `None` when none has arrived
    async fn latest_report(
        &self,
        definition: &HealthDefRef,
        cluster: &ClusterRef,
    ) -> Result<Option<HealthReportSpec>>;
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// One condition per liveness check, in declaration order
    pub conditions: Vec<Condition>,
    pub passing: bool,
    /// Per-check failures; the matching conditions are `Unknown`
    pub errors: Vec<String>,
}

impl Evaluation {
    /// Collapse the recorded check errors into one error
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        if self.errors.is_empty() {
            None
        } else {
            Some(Error::Evaluation(self.errors.join("; ")))
        }
    }
}

/// Stable condition type for a liveness check: `<Type>-<name>`.
///
/// Check types never contain `-`, so the type prefix always splits off
/// unambiguously and two checks can only collide by sharing type and name.
#[must_use]
pub fn condition_type(check: &LivenessCheck) -> String {
    format!("{}-{}", check.check_type, check.name)
}

pub struct Evaluator {
    addons: Arc<dyn AddonStatusSource>,
    reports: Arc<dyn HealthReportSource>,
    call_timeout: Duration,
}

impl Evaluator {
    #[must_use]
    pub fn new(
        addons: Arc<dyn AddonStatusSource>,
        reports: Arc<dyn HealthReportSource>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            addons,
            reports,
            call_timeout,
        }
    }

    /// Run every liveness check of `spec` against `cluster`.
    ///
    /// A failing check never aborts the pass: its condition becomes `Unknown`
    /// and the error is recorded in the returned `Evaluation`.
    #[instrument(skip_all, fields(cluster = %cluster, policy = %policy.name))]
    pub async fn evaluate(
        &self,
        cluster: &ClusterRef,
        policy: &PolicyRef,
        spec: &HealthPolicySpec,
    ) -> Evaluation {
        let mut evaluation = Evaluation::default();

        for check in &spec.liveness_checks {
            let outcome = match check.check_type {
                LivenessType::Addons => self.evaluate_addons(cluster, policy).await,
                LivenessType::HealthCheck => self.evaluate_health_check(check, cluster).await,
            };

            let (status, message) = match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!(check = %check.name, error = %e, "Liveness check failed");
                    evaluation
                        .errors
                        .push(format!("liveness check {}: {e}", check.name));
                    (ConditionStatus::Unknown, Some(e.to_string()))
                }
            };

            evaluation.conditions.push(Condition {
                condition_type: condition_type(check),
                status,
                message,
            });
        }

        evaluation.passing = evaluation
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::True);

        debug!(
            conditions = evaluation.conditions.len(),
            passing = evaluation.passing,
            errors = evaluation.errors.len(),
            "Evaluated liveness checks"
        );
        evaluation
    }

    async fn evaluate_addons(
        &self,
        cluster: &ClusterRef,
        policy: &PolicyRef,
    ) -> Result<(ConditionStatus, Option<String>)> {
        let features = self
            .bounded(self.addons.addon_status(cluster, policy))
            .await?;
        Ok(addon_condition(&features))
    }

    async fn evaluate_health_check(
        &self,
        check: &LivenessCheck,
        cluster: &ClusterRef,
    ) -> Result<(ConditionStatus, Option<String>)> {
        let source = check.liveness_source_ref.as_ref().ok_or_else(|| {
            Error::Evaluation(format!("liveness check {} has no livenessSourceRef", check.name))
        })?;

        let definition = ObjectKey::health_definition(&source.name);
        let report = self
            .bounded(self.reports.latest_report(&definition, cluster))
            .await?;

        Ok(match report {
            Some(report) => report_condition(&report),
            None => (
                ConditionStatus::Unknown,
                Some(format!("no HealthReport for {} yet", source.name)),
            ),
        })
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| Error::Timeout(self.call_timeout))?
    }
}

fn addon_condition(features: &[FeatureSummary]) -> (ConditionStatus, Option<String>) {
    let pending: Vec<String> = features
        .iter()
        .filter(|f| f.status != FeatureStatus::Provisioned)
        .map(|f| match &f.failure_message {
            Some(reason) => format!("{} {:?}: {reason}", f.feature_id, f.status),
            None => format!("{} {:?}", f.feature_id, f.status),
        })
        .collect();

    if pending.is_empty() {
        (ConditionStatus::True, None)
    } else {
        (ConditionStatus::False, Some(pending.join("; ")))
    }
}

fn report_condition(report: &HealthReportSpec) -> (ConditionStatus, Option<String>) {
    let unhealthy: Vec<String> = report
        .unhealthy()
        .map(|status| {
            let resource = &status.resource;
            let name = if resource.namespace.is_empty() {
                format!("{}/{}", resource.kind, resource.name)
            } else {
                format!("{}/{}/{}", resource.kind, resource.namespace, resource.name)
            };
            match &status.message {
                Some(message) => format!("{name} {:?}: {message}", status.health_status),
                None => format!("{name} {:?}", status.health_status),
            }
        })
        .collect();

    if unhealthy.is_empty() {
        return (ConditionStatus::True, None);
    }

    let mut message = unhealthy
        .iter()
        .take(MAX_REPORTED_RESOURCES)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if unhealthy.len() > MAX_REPORTED_RESOURCES {
        message.push_str(&format!(
            " (and {} more)",
            unhealthy.len() - MAX_REPORTED_RESOURCES
        ));
    }
    (ConditionStatus::False, Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        ClusterType, HealthStatus, LivenessSourceRef, ReportedResource, ResourceStatus,
    };

    fn cluster() -> ClusterRef {
        ObjectKey::cluster("fleet", "a", ClusterType::Managed)
    }

    fn addons_check(name: &str) -> LivenessCheck {
        LivenessCheck {
            name: name.to_string(),
            check_type: LivenessType::Addons,
            liveness_source_ref: None,
        }
    }

    fn health_check(name: &str, definition: &str) -> LivenessCheck {
        LivenessCheck {
            name: name.to_string(),
            check_type: LivenessType::HealthCheck,
            liveness_source_ref: Some(LivenessSourceRef {
                name: definition.to_string(),
                kind: None,
                api_version: None,
            }),
        }
    }

    fn spec(checks: Vec<LivenessCheck>) -> HealthPolicySpec {
        HealthPolicySpec {
            cluster_selector: "env=prod".to_string(),
            liveness_checks: checks,
            notifications: Vec::new(),
            shard_key: None,
        }
    }

    fn report(statuses: Vec<(&str, HealthStatus)>) -> HealthReportSpec {
        HealthReportSpec {
            cluster_namespace: "fleet".to_string(),
            cluster_name: "a".to_string(),
            cluster_type: ClusterType::Managed,
            health_definition_name: "replicas".to_string(),
            resource_statuses: statuses
                .into_iter()
                .map(|(name, health_status)| ResourceStatus {
                    resource: ReportedResource {
                        kind: "Deployment".to_string(),
                        namespace: "apps".to_string(),
                        name: name.to_string(),
                    },
                    health_status,
                    message: None,
                })
                .collect(),
        }
    }

    fn evaluator(addons: MockAddonStatusSource, reports: MockHealthReportSource) -> Evaluator {
        Evaluator::new(Arc::new(addons), Arc::new(reports), Duration::from_secs(1))
    }

    #[test]
    fn test_condition_type_is_stable() {
        assert_eq!(condition_type(&addons_check("core")), "Addons-core");
        assert_eq!(
            condition_type(&health_check("web", "replicas")),
            "HealthCheck-web"
        );
    }

    #[tokio::test]
    async fn test_addons_passing() {
        let mut addons = MockAddonStatusSource::new();
        addons.expect_addon_status().times(1).returning(|_, _| {
            Ok(vec![FeatureSummary {
                feature_id: "Helm".to_string(),
                status: FeatureStatus::Provisioned,
                failure_message: None,
            }])
        });

        let evaluation = evaluator(addons, MockHealthReportSource::new())
            .evaluate(&cluster(), &ObjectKey::policy("p"), &spec(vec![addons_check("core")]))
            .await;

        assert_eq!(evaluation.conditions.len(), 1);
        assert_eq!(evaluation.conditions[0].condition_type, "Addons-core");
        assert_eq!(evaluation.conditions[0].status, ConditionStatus::True);
        assert!(evaluation.passing);
        assert!(evaluation.error().is_none());
    }

    #[tokio::test]
    async fn test_addons_not_provisioned() {
        let mut addons = MockAddonStatusSource::new();
        addons.expect_addon_status().returning(|_, _| {
            Ok(vec![FeatureSummary {
                feature_id: "Helm".to_string(),
                status: FeatureStatus::Failed,
                failure_message: Some("chart not found".to_string()),
            }])
        });

        let evaluation = evaluator(addons, MockHealthReportSource::new())
            .evaluate(&cluster(), &ObjectKey::policy("p"), &spec(vec![addons_check("core")]))
            .await;

        assert_eq!(evaluation.conditions[0].status, ConditionStatus::False);
        assert_eq!(
            evaluation.conditions[0].message.as_deref(),
            Some("Helm Failed: chart not found")
        );
        assert!(!evaluation.passing);
        assert!(evaluation.errors.is_empty());
    }

    #[tokio::test]
    async fn test_report_error_yields_unknown_and_continues() {
        let mut addons = MockAddonStatusSource::new();
        addons.expect_addon_status().returning(|_, _| Ok(Vec::new()));
        let mut reports = MockHealthReportSource::new();
        reports
            .expect_latest_report()
            .returning(|_, _| Err(Error::Evaluation("cluster unreachable".to_string())));

        let evaluation = evaluator(addons, reports)
            .evaluate(
                &cluster(),
                &ObjectKey::policy("p"),
                &spec(vec![health_check("web", "replicas"), addons_check("core")]),
            )
            .await;

        assert_eq!(evaluation.conditions.len(), 2);
        assert_eq!(evaluation.conditions[0].status, ConditionStatus::Unknown);
        assert_eq!(evaluation.conditions[1].status, ConditionStatus::True);
        assert!(!evaluation.passing);
        assert_eq!(evaluation.errors.len(), 1);
        assert!(evaluation.error().is_some());
    }

    #[tokio::test]
    async fn test_health_report_translation() {
        let mut reports = MockHealthReportSource::new();
        reports.expect_latest_report().returning(|definition, _| {
            Ok(match definition.name.as_str() {
                "replicas" => Some(report(vec![("web", HealthStatus::Healthy)])),
                "pods" => Some(report(vec![
                    ("api", HealthStatus::Healthy),
                    ("worker", HealthStatus::Degraded),
                ])),
                _ => None,
            })
        });

        let evaluation = evaluator(MockAddonStatusSource::new(), reports)
            .evaluate(
                &cluster(),
                &ObjectKey::policy("p"),
                &spec(vec![
                    health_check("web", "replicas"),
                    health_check("workers", "pods"),
                    health_check("late", "missing"),
                ]),
            )
            .await;

        let statuses: Vec<_> = evaluation.conditions.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                ConditionStatus::True,
                ConditionStatus::False,
                ConditionStatus::Unknown
            ]
        );
        assert_eq!(
            evaluation.conditions[1].message.as_deref(),
            Some("Deployment/apps/worker Degraded")
        );
        assert!(evaluation.errors.is_empty());
        assert!(!evaluation.passing);
    }

    #[tokio::test]
    async fn test_missing_source_ref_is_recorded() {
        let mut check = health_check("web", "replicas");
        check.liveness_source_ref = None;

        let evaluation = evaluator(MockAddonStatusSource::new(), MockHealthReportSource::new())
            .evaluate(&cluster(), &ObjectKey::policy("p"), &spec(vec![check]))
            .await;

        assert_eq!(evaluation.conditions[0].status, ConditionStatus::Unknown);
        assert_eq!(evaluation.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_check_list_is_passing() {
        let evaluation = evaluator(MockAddonStatusSource::new(), MockHealthReportSource::new())
            .evaluate(&cluster(), &ObjectKey::policy("p"), &spec(Vec::new()))
            .await;

        assert!(evaluation.conditions.is_empty());
        assert!(evaluation.passing);
    }

    #[test]
    fn test_long_unhealthy_list_is_truncated() {
        let statuses = (0..8)
            .map(|i| (format!("web-{i}"), HealthStatus::Progressing))
            .collect::<Vec<_>>();
        let report = report(
            statuses
                .iter()
                .map(|(name, status)| (name.as_str(), *status))
                .collect(),
        );

        let (status, message) = report_condition(&report);
        assert_eq!(status, ConditionStatus::False);
        assert!(message.unwrap().ends_with("(and 3 more)"));
    }
}
