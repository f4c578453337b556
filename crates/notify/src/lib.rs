//! Webhook notifications for cluster health transitions.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{NotifyChannel, NotifyEvent, SlackChannel};
//!
//! # async fn run(event: NotifyEvent) -> Result<(), notify::ChannelError> {
//! let channel = SlackChannel::new("https://hooks.slack.com/services/T000/B000/XXXX".to_string());
//! channel.send(&event).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`SlackChannel`] implements Slack incoming-webhook notifications
//! - [`DiscordChannel`] implements Discord webhook notifications
//!
//! Webhook URLs are supplied by the caller (the controller reads them from
//! the Secret referenced by a policy notification).

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::discord::{DiscordChannel, DISCORD_WEBHOOK_URL_KEY};
pub use channels::slack::{SlackChannel, SLACK_WEBHOOK_URL_KEY};
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{ConditionLine, NotifyEvent, Severity};
