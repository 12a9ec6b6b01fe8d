//! Entry points for external producers

use crate::message::{Message, MessageData};
use crate::queue::{JobQueue, WorkItem, COMMAND, IN};
use crate::workflow::Decision;
use listrust_common::Result;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct Intake {
    queue: JobQueue,
}

impl Intake {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Parse a raw post and queue it for the list's posting chain
    pub async fn inject(&self, list_id: &str, raw: &[u8], msgdata: MessageData) -> Result<Uuid> {
        let msg = Message::parse(raw)?;
        info!(
            list_id = %list_id,
            message_id = ?msg.message_id,
            sender = ?msg.sender,
            size = msg.size,
            "Message received"
        );
        self.queue
            .enqueue(
                IN,
                &WorkItem::Message {
                    list_id: list_id.to_lowercase(),
                    msg,
                    msgdata,
                },
            )
            .await
    }

    /// Queue a workflow continuation, e.g. a confirmation reply
    pub async fn continuation(&self, token: &str, decision: Decision) -> Result<Uuid> {
        self.queue
            .enqueue(
                COMMAND,
                &WorkItem::Continuation {
                    token: token.to_string(),
                    decision,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::ANNE_POST;
    use listrust_storage::memory::MemoryJobRepository;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_inject_queues_parsed_message() {
        let queue = JobQueue::new(Arc::new(MemoryJobRepository::new()), 5);
        let intake = Intake::new(queue.clone());

        intake
            .inject("Test@example.com", ANNE_POST.as_bytes(), MessageData::default())
            .await
            .unwrap();

        match &queue.items(IN).await.unwrap()[..] {
            [WorkItem::Message { list_id, msg, .. }] => {
                assert_eq!(list_id, "test@example.com");
                assert_eq!(msg.subject.as_deref(), Some("Hello list"));
            }
            other => panic!("unexpected items {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_continuation_goes_to_command_queue() {
        let queue = JobQueue::new(Arc::new(MemoryJobRepository::new()), 5);
        let intake = Intake::new(queue.clone());
        intake.continuation("abc", Decision::Confirm).await.unwrap();
        assert_eq!(queue.items(COMMAND).await.unwrap().len(), 1);
        assert!(queue.items(IN).await.unwrap().is_empty());
    }
}
