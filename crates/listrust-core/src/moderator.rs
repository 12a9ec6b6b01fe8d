//! Moderator decisions on held requests

use crate::chain::handlers::held as held_message;
use crate::context::Context;
use crate::message::{Message, MessageData};
use crate::notify::{templates, Notification};
use crate::queue::{WorkItem, PIPELINE};
use crate::requests::HeldEntry;
use crate::workflow::{held as held_subscription, Decision, Outcome, WorkflowEngine};
use listrust_common::types::{RequestId, RequestType};
use listrust_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Reject { reason: Option<String> },
    Discard,
    /// Leave the request held
    Defer,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject { .. } => "reject",
            Action::Discard => "discard",
            Action::Defer => "defer",
        }
    }
}

#[derive(Clone)]
pub struct Moderator {
    ctx: Context,
    engine: WorkflowEngine,
}

impl Moderator {
    pub fn new(ctx: Context, engine: WorkflowEngine) -> Self {
        Self { ctx, engine }
    }

    async fn entry(&self, list_id: &str, id: RequestId, kind: RequestType) -> Result<HeldEntry> {
        self.ctx
            .requests
            .for_list(list_id)
            .get(id, Some(kind))
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} request {} on {}", kind.as_str(), id, list_id)))
    }

    /// Dispose of a held post
    pub async fn handle_message(&self, list_id: &str, id: RequestId, action: Action) -> Result<()> {
        let entry = self.entry(list_id, id, RequestType::HeldMessage).await?;
        if action == Action::Defer {
            info!(list_id = %list_id, request_id = id, "Held message deferred");
            return Ok(());
        }

        let data = entry
            .data
            .ok_or_else(|| Error::Storage(format!("Held message {} has no data", id)))?;
        let msg: Message = data
            .get(held_message::MSG)?
            .ok_or_else(|| Error::Storage(format!("Held message {} has no message", id)))?;
        let mut msgdata: MessageData = data.get(held_message::MSGDATA)?.unwrap_or_default();

        let ledger = self.ctx.requests.for_list(list_id);
        let label = action.as_str();
        match action {
            Action::Approve => {
                msgdata.approved = true;
                let job_id = self
                    .ctx
                    .queue
                    .enqueue(
                        PIPELINE,
                        &WorkItem::Message {
                            list_id: list_id.to_string(),
                            msg,
                            msgdata,
                        },
                    )
                    .await?;

                // The post goes on only for the caller that resolves the entry
                let resolved = ledger.resolve(id).await;
                if !matches!(resolved, Ok(Some(_))) {
                    if let Err(e) = self.ctx.queue.complete(job_id).await {
                        warn!(list_id = %list_id, request_id = id, error = %e, "Failed to withdraw approved post");
                    }
                    resolved?;
                    return Err(Error::NotFound(format!("held message {} on {}", id, list_id)));
                }
            }
            action => {
                // Only the caller that resolves the entry acts on it
                if ledger.resolve(id).await?.is_none() {
                    return Err(Error::NotFound(format!("held message {} on {}", id, list_id)));
                }
                if let Action::Reject { reason } = action {
                    if let Some(sender) = msg.sender.as_deref() {
                        self.ctx
                            .notifier
                            .send(
                                Notification::new(list_id, sender, templates::POST_REJECTED)
                                    .with("subject", msg.subject.clone().unwrap_or_default())
                                    .with(
                                        "reasons",
                                        reason.unwrap_or_else(|| "[No reason given]".to_string()),
                                    ),
                            )
                            .await?;
                    }
                }
            }
        }

        info!(
            list_id = %list_id,
            request_id = id,
            key = %entry.key,
            action = label,
            "Held message handled"
        );
        Ok(())
    }

    pub async fn handle_subscription(
        &self,
        list_id: &str,
        id: RequestId,
        action: Action,
    ) -> Result<Option<Outcome>> {
        self.handle_membership(list_id, id, RequestType::Subscription, action)
            .await
    }

    pub async fn handle_unsubscription(
        &self,
        list_id: &str,
        id: RequestId,
        action: Action,
    ) -> Result<Option<Outcome>> {
        self.handle_membership(list_id, id, RequestType::Unsubscription, action)
            .await
    }

    /// Membership requests are owned by their workflow; the decision
    /// resumes it
    async fn handle_membership(
        &self,
        list_id: &str,
        id: RequestId,
        kind: RequestType,
        action: Action,
    ) -> Result<Option<Outcome>> {
        let entry = self.entry(list_id, id, kind).await?;
        let decision = match action {
            Action::Approve => Decision::Approve,
            Action::Reject { reason } => Decision::Reject { reason },
            Action::Discard => Decision::Discard,
            Action::Defer => {
                info!(list_id = %list_id, request_id = id, "Membership request deferred");
                return Ok(None);
            }
        };

        let token = entry
            .data
            .as_ref()
            .and_then(|d| d.get_str(held_subscription::TOKEN))
            .map(str::to_string)
            .ok_or_else(|| Error::Storage(format!("Request {} has no workflow token", id)))?;

        match self.engine.resume(&token, decision).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(Error::UnknownContinuation(token)) => {
                // The workflow expired; its ledger entry is dead
                warn!(list_id = %list_id, request_id = id, "Workflow behind request expired");
                self.ctx.requests.for_list(list_id).resolve(id).await?;
                Err(Error::UnknownContinuation(token))
            }
            Err(e) => Err(e),
        }
    }
}
