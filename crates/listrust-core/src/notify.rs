//! Notification requests
//!
//! The core never renders or sends text. It enqueues a request naming a
//! template and its substitutions on the `virgin` queue, where the external
//! templating and delivery component picks it up.

use crate::queue::{JobQueue, WorkItem, VIRGIN};
use listrust_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Template names
pub mod templates {
    pub const CONFIRM_SUBSCRIBE: &str = "list:user:action:subscribe";
    pub const CONFIRM_UNSUBSCRIBE: &str = "list:user:action:unsubscribe";
    pub const WELCOME: &str = "list:user:notice:welcome";
    pub const GOODBYE: &str = "list:user:notice:goodbye";
    pub const SUBSCRIPTION_DENIED: &str = "list:user:notice:refuse";
    pub const POST_HELD_ACK: &str = "list:user:notice:hold";
    pub const POST_REJECTED: &str = "list:user:notice:rejected";
    pub const SUBSCRIPTION_HELD: &str = "list:admin:action:subscribe";
    pub const UNSUBSCRIPTION_HELD: &str = "list:admin:action:unsubscribe";
    pub const POST_HELD: &str = "list:admin:action:post";
    pub const ADMIN_SUBSCRIBED: &str = "list:admin:notice:subscribe";
    pub const ADMIN_UNSUBSCRIBED: &str = "list:admin:notice:unsubscribe";
}

/// An outgoing notification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub template: String,
    pub list_id: String,
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(list_id: &str, recipient: &str, template: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            template: template.to_string(),
            list_id: list_id.to_string(),
            substitutions: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.substitutions.insert(key.to_string(), value.into());
        self
    }
}

/// Enqueues notification requests
#[derive(Clone)]
pub struct Notifier {
    queue: JobQueue,
}

impl Notifier {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub async fn send(&self, notification: Notification) -> Result<()> {
        debug!(
            list_id = %notification.list_id,
            recipient = %notification.recipient,
            template = %notification.template,
            "Queueing notification"
        );
        self.queue
            .enqueue(VIRGIN, &WorkItem::Notification(notification))
            .await?;
        Ok(())
    }

    /// Pending notification requests, oldest first
    pub async fn pending(&self) -> Result<Vec<Notification>> {
        Ok(self
            .queue
            .items(VIRGIN)
            .await?
            .into_iter()
            .filter_map(|item| match item {
                WorkItem::Notification(n) => Some(n),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listrust_storage::memory::MemoryJobRepository;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_send_enqueues_on_virgin() {
        let notifier = Notifier::new(JobQueue::new(Arc::new(MemoryJobRepository::new()), 5));
        let notification = Notification::new(
            "test@example.com",
            "anne@example.com",
            templates::CONFIRM_SUBSCRIBE,
        )
        .with("token", "abc");
        notifier.send(notification.clone()).await.unwrap();

        assert_eq!(notifier.pending().await.unwrap(), vec![notification]);
    }
}
