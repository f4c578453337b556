//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Secret key holding the Slack webhook URL.
pub const SLACK_WEBHOOK_URL_KEY: &str = "SLACK_WEBHOOK_URL";

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url).filter(|url| !url.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a Slack webhook payload.
    fn format_payload(event: &NotifyEvent) -> SlackPayload {
        let fields = event
            .fields()
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: event.title(),
            color: event.severity().hex().to_string(),
            author_name: Some("Cluster Health".to_string()),
            title: event.title(),
            text: event.description(),
            fields,
            footer: Some(format!(
                "{} | {}",
                event.severity().as_str(),
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(event.timestamp().timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(SLACK_WEBHOOK_URL_KEY.to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "slack", event = %event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "slack",
                status = %status,
                body = %body,
                "Slack webhook request failed"
            );

            Err(ChannelError::Rejected {
                channel: "Slack",
                status: status.as_u16(),
                body,
            })
        }
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}
