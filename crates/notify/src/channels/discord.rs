//! Discord webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Secret key holding the Discord webhook URL.
pub const DISCORD_WEBHOOK_URL_KEY: &str = "DISCORD_WEBHOOK_URL";

/// Discord webhook notification channel.
pub struct DiscordChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl DiscordChannel {
    /// Create a Discord channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url).filter(|url| !url.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a Discord webhook payload.
    fn format_payload(event: &NotifyEvent) -> DiscordPayload {
        let fields = event
            .fields()
            .into_iter()
            .map(|(name, value)| DiscordField {
                name,
                value,
                inline: true,
            })
            .collect();

        DiscordPayload {
            embeds: vec![DiscordEmbed {
                title: event.title(),
                description: event.description(),
                color: event.severity().color(),
                fields,
                footer: DiscordFooter {
                    text: format!("Cluster Health | {}", event.severity().as_str()),
                },
                timestamp: event.timestamp().to_rfc3339(),
            }],
        }
    }
}

#[async_trait]
impl NotifyChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(DISCORD_WEBHOOK_URL_KEY.to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "discord", event = %event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(channel = "discord", "Notification sent successfully");
            return Ok(());
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(1, |secs| secs.ceil() as u64);
            warn!(channel = "discord", retry_after_secs, "Discord rate limited webhook");
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            channel = "discord",
            status = %status,
            body = %body,
            "Discord webhook request failed"
        );

        Err(ChannelError::Rejected {
            channel: "Discord",
            status: status.as_u16(),
            body,
        })
    }
}

// =============================================================================
// Discord API types
// =============================================================================

#[derive(Debug, Serialize)]
struct DiscordPayload {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
    footer: DiscordFooter,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}
