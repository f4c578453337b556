//! Notification delivery for passing clusters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::api::PostParams;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use notify::{
    ConditionLine, DiscordChannel, NotifyChannel, NotifyEvent, SlackChannel,
    DISCORD_WEBHOOK_URL_KEY, SLACK_WEBHOOK_URL_KEY,
};
use tracing::{debug, info, warn};

use crate::crds::{Condition, Notification, NotificationType, SecretRef};
use crate::engine::set::ClusterRef;
use crate::engine::DeliveryOutcome;
use crate::error::{Error, Result};

/// Event reason attached to health notifications
pub const HEALTHY_REASON: &str = "ClusterHealthy";

/// Component name reported as the event source
pub const EVENT_COMPONENT: &str = "healthcheck-controller";

/// Delivers one notification for one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        notification: &Notification,
        cluster: &ClusterRef,
        event: &NotifyEvent,
    ) -> DeliveryOutcome;
}

/// Notification payload for a cluster evaluated by `policy`
#[must_use]
pub fn health_event(
    policy: &str,
    cluster: &ClusterRef,
    conditions: &[Condition],
    passing: bool,
) -> NotifyEvent {
    NotifyEvent {
        policy: policy.to_string(),
        cluster_namespace: cluster.namespace.clone(),
        cluster_name: cluster.name.clone(),
        cluster_type: cluster
            .cluster_type()
            .map_or_else(|| cluster.kind.clone(), |t| t.to_string()),
        passing,
        conditions: conditions
            .iter()
            .map(|c| ConditionLine {
                condition_type: c.condition_type.clone(),
                status: format!("{:?}", c.status),
                message: c.message.clone(),
            })
            .collect(),
        timestamp: Utc::now(),
    }
}

/// Routes notifications to Kubernetes Events or chat webhooks
pub struct NotificationRouter {
    client: Client,
}

impl NotificationRouter {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn emit_event(&self, cluster: &ClusterRef, event: &NotifyEvent) -> Result<()> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &cluster.namespace);
        api.create(&PostParams::default(), &kubernetes_event(cluster, event))
            .await?;
        Ok(())
    }

    async fn webhook_url(&self, secret_ref: &SecretRef, key: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = api.get(&secret_ref.name).await?;
        secret_value(secret.data.as_ref(), key).ok_or_else(|| {
            Error::ConfigError(format!(
                "secret {}/{} has no {key}",
                secret_ref.namespace, secret_ref.name
            ))
        })
    }

    async fn send_webhook(
        &self,
        notification: &Notification,
        event: &NotifyEvent,
    ) -> Result<()> {
        let secret_ref = notification.notification_ref.as_ref().ok_or_else(|| {
            Error::ConfigError(format!(
                "notification {} has no notificationRef",
                notification.name
            ))
        })?;

        let key = match notification.notification_type {
            NotificationType::Discord => DISCORD_WEBHOOK_URL_KEY,
            _ => SLACK_WEBHOOK_URL_KEY,
        };
        let channel = webhook_channel(notification, self.webhook_url(secret_ref, key).await?)?;

        debug!(channel = channel.name(), notification = %notification.name, "Sending webhook notification");
        channel.send(event).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for NotificationRouter {
    async fn deliver(
        &self,
        notification: &Notification,
        cluster: &ClusterRef,
        event: &NotifyEvent,
    ) -> DeliveryOutcome {
        let result = match notification.notification_type {
            NotificationType::KubernetesEvent => self.emit_event(cluster, event).await,
            NotificationType::Slack | NotificationType::Discord => {
                self.send_webhook(notification, event).await
            }
        };

        match result {
            Ok(()) => {
                info!(
                    notification = %notification.name,
                    cluster = %cluster,
                    "📣 Delivered health notification"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    notification = %notification.name,
                    cluster = %cluster,
                    error = %e,
                    "Failed to deliver health notification"
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Decode a UTF-8 value from secret data, ignoring surrounding whitespace
fn secret_value(data: Option<&BTreeMap<String, ByteString>>, key: &str) -> Option<String> {
    let bytes = data?.get(key)?;
    let value = String::from_utf8(bytes.0.clone()).ok()?;
    Some(value.trim().to_string())
}

/// Webhook channel for `notification`, refusing one without a usable URL
fn webhook_channel(notification: &Notification, webhook_url: String) -> Result<Box<dyn NotifyChannel>> {
    let channel: Box<dyn NotifyChannel> = match notification.notification_type {
        NotificationType::Slack => Box::new(SlackChannel::new(webhook_url)),
        NotificationType::Discord => Box::new(DiscordChannel::new(webhook_url)),
        NotificationType::KubernetesEvent => {
            return Err(Error::ConfigError(
                "Kubernetes events are not delivered through webhooks".to_string(),
            ))
        }
    };
    if !channel.enabled() {
        return Err(Error::ConfigError(format!(
            "{} webhook URL for notification {} is empty",
            channel.name(),
            notification.name
        )));
    }
    Ok(channel)
}

/// Normal event on the cluster object announcing its health
fn kubernetes_event(cluster: &ClusterRef, event: &NotifyEvent) -> Event {
    let now = Time(event.timestamp);
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", cluster.name)),
            namespace: Some(cluster.namespace.clone()),
            ..ObjectMeta::default()
        },
        involved_object: ObjectReference {
            api_version: Some(cluster.api_version.clone()),
            kind: Some(cluster.kind.clone()),
            name: Some(cluster.name.clone()),
            namespace: Some(cluster.namespace.clone()),
            ..ObjectReference::default()
        },
        reason: Some(HEALTHY_REASON.to_string()),
        message: Some(format!("{} (policy {})", event.title(), event.policy)),
        type_: Some("Normal".to_string()),
        source: Some(EventSource {
            component: Some(EVENT_COMPONENT.to_string()),
            host: None,
        }),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        ..Event::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ClusterType, ConditionStatus};
    use crate::engine::set::ObjectKey;

    fn cluster() -> ClusterRef {
        ObjectKey::cluster("fleet", "east", ClusterType::Capi)
    }

    #[test]
    fn test_health_event_carries_conditions() {
        let conditions = vec![Condition {
            condition_type: "Addons-core".to_string(),
            status: ConditionStatus::True,
            message: None,
        }];

        let event = health_event("prod", &cluster(), &conditions, true);
        assert_eq!(event.cluster_type, "Capi");
        assert_eq!(event.title(), "Cluster fleet/east is healthy");
        assert_eq!(event.conditions[0].status, "True");
    }

    #[test]
    fn test_kubernetes_event_targets_cluster() {
        let event = health_event("prod", &cluster(), &[], true);
        let k8s_event = kubernetes_event(&cluster(), &event);

        assert_eq!(k8s_event.metadata.generate_name.as_deref(), Some("east-"));
        assert_eq!(k8s_event.involved_object.kind.as_deref(), Some("Cluster"));
        assert_eq!(
            k8s_event.involved_object.api_version.as_deref(),
            Some("cluster.x-k8s.io/v1beta1")
        );
        assert_eq!(k8s_event.reason.as_deref(), Some(HEALTHY_REASON));
        assert_eq!(k8s_event.type_.as_deref(), Some("Normal"));
    }

    #[test]
    fn test_secret_value() {
        let mut data = BTreeMap::new();
        data.insert(
            SLACK_WEBHOOK_URL_KEY.to_string(),
            ByteString(b"https://hooks.example/abc\n".to_vec()),
        );
        data.insert(DISCORD_WEBHOOK_URL_KEY.to_string(), ByteString(Vec::new()));

        assert_eq!(
            secret_value(Some(&data), SLACK_WEBHOOK_URL_KEY).as_deref(),
            Some("https://hooks.example/abc")
        );
        assert_eq!(secret_value(Some(&data), DISCORD_WEBHOOK_URL_KEY).as_deref(), Some(""));
        assert!(secret_value(None, SLACK_WEBHOOK_URL_KEY).is_none());
    }

    fn notification(notification_type: NotificationType) -> Notification {
        Notification {
            name: "oncall".to_string(),
            notification_type,
            notification_ref: None,
        }
    }

    #[test]
    fn test_webhook_channel_requires_url() {
        let slack = webhook_channel(
            &notification(NotificationType::Slack),
            "https://hooks.example/abc".to_string(),
        )
        .unwrap();
        assert_eq!(slack.name(), "slack");

        let err = webhook_channel(&notification(NotificationType::Discord), String::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("webhook URL for notification oncall is empty"));

        assert!(webhook_channel(
            &notification(NotificationType::KubernetesEvent),
            "https://hooks.example/abc".to_string()
        )
        .is_err());
    }
}
