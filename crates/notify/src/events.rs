//! Notification event types for cluster health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the Discord embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get the Slack attachment color for this severity.
    #[must_use]
    pub const fn hex(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",
            Self::Warning => "#f39c12",
            Self::Critical => "#e74c3c",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// One liveness condition as shown in a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionLine {
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health state of one cluster as evaluated by one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEvent {
    pub policy: String,
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub cluster_type: String,
    pub passing: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionLine>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl NotifyEvent {
    /// Get a short title for this event.
    #[must_use]
    pub fn title(&self) -> String {
        let state = if self.passing { "healthy" } else { "unhealthy" };
        format!(
            "Cluster {}/{} is {state}",
            self.cluster_namespace, self.cluster_name
        )
    }

    /// Get the severity/color for this event.
    ///
    /// A failing check is critical; checks that could not be decided only
    /// warn.
    #[must_use]
    pub fn severity(&self) -> Severity {
        if self.passing {
            Severity::Info
        } else if self.conditions.iter().any(|c| c.status == "False") {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Multi-line summary of the conditions, one per line.
    #[must_use]
    pub fn description(&self) -> String {
        if self.conditions.is_empty() {
            return format!("Policy `{}` has no liveness checks", self.policy);
        }

        self.conditions
            .iter()
            .map(|c| {
                let icon = if c.status == "True" { "✅" } else { "❌" };
                match &c.message {
                    Some(message) => format!("{icon} `{}` {}: {message}", c.condition_type, c.status),
                    None => format!("{icon} `{}` {}", c.condition_type, c.status),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Key/value fields shown next to the description.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, String)> {
        vec![
            ("Policy".to_string(), self.policy.clone()),
            (
                "Cluster".to_string(),
                format!("{}/{}", self.cluster_namespace, self.cluster_name),
            ),
            ("Cluster Type".to_string(), self.cluster_type.clone()),
        ]
    }
}

#[cfg(test)]
pub(crate) fn sample_event() -> NotifyEvent {
    NotifyEvent {
        policy: "prod-health".to_string(),
        cluster_namespace: "fleet".to_string(),
        cluster_name: "east".to_string(),
        cluster_type: "Managed".to_string(),
        passing: true,
        conditions: vec![ConditionLine {
            condition_type: "Addons-core".to_string(),
            status: "True".to_string(),
            message: None,
        }],
        timestamp: Utc::now(),
    }
}
