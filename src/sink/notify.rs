//! Log-only notifier

use async_trait::async_trait;

use super::{Notification, Notifier};
use crate::error::Result;

/// Writes notifications to the log instead of a desktop alert service.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            title = %notification.title,
            body = %notification.body,
            path = notification.path().unwrap_or(""),
            "Notification"
        );
        Ok(())
    }
}
