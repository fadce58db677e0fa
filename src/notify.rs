//! Best-effort run notifications.
//!
//! The engine never depends on a concrete transport: the coordinator calls
//! [`Notifier::notify`] after sealing a run and logs (but otherwise ignores)
//! any failure. The default [`LogNotifier`] writes the summary to the log,
//! which is also what the built-in slack/mattermost handlers do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::report::Report;

/// Notification transport selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    #[default]
    Mail,
    Slack,
    Mattermost,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        channel: NotifyChannel,
        header: &str,
        report: &Report,
        recipients: &[String],
    ) -> anyhow::Result<()>;
}

/// Default notifier: a structured log line per notification.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        channel: NotifyChannel,
        header: &str,
        report: &Report,
        recipients: &[String],
    ) -> anyhow::Result<()> {
        info!(
            ?channel,
            recipients = recipients.join(",").as_str(),
            success = ?report.success,
            "{header}"
        );
        Ok(())
    }
}
