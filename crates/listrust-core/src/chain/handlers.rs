//! Built-in handlers
//!
//! `accept`, `hold`, `reject` and `discard` carry out a chain's disposition.
//! The rest are pipeline steps applied to accepted posts.

use super::{Context, Handler};
use crate::message::{Message, MessageData};
use crate::notify::{templates, Notification};
use crate::pending::Pendable;
use crate::queue::{WorkItem, OUT, PIPELINE};
use async_trait::async_trait;
use listrust_common::types::{DeliveryMode, MemberRole, RequestId, RequestType};
use listrust_common::Result;
use listrust_storage::MailingList;
use std::sync::Arc;
use tracing::{info, warn};

/// Pended keys of a held message
pub mod held {
    pub const TYPE: &str = "held message";
    pub const MSG: &str = "msg";
    pub const MSGDATA: &str = "msgdata";
    pub const SENDER: &str = "sender";
    pub const SUBJECT: &str = "subject";
    pub const REASONS: &str = "reasons";
}

/// Every built-in handler
pub fn builtin() -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(Accept),
        Arc::new(Hold),
        Arc::new(Reject),
        Arc::new(Discard),
        Arc::new(CookHeaders),
        Arc::new(CalculateRecipients),
        Arc::new(AfterDelivery),
        Arc::new(ToOutgoing),
    ]
}

fn reasons_text(msgdata: &MessageData) -> String {
    if msgdata.moderation_reasons.is_empty() {
        "N/A".to_string()
    } else {
        msgdata.moderation_reasons.join("; ")
    }
}

/// Send the post on to the list's pipeline
pub struct Accept;

#[async_trait]
impl Handler for Accept {
    fn name(&self) -> &'static str {
        "accept"
    }

    fn description(&self) -> &'static str {
        "Accept the message for posting."
    }

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        ctx.queue
            .enqueue(
                PIPELINE,
                &WorkItem::Message {
                    list_id: list.list_id.clone(),
                    msg: msg.clone(),
                    msgdata: msgdata.clone(),
                },
            )
            .await?;
        info!(list_id = %list.list_id, message_id = ?msg.message_id, "Post accepted");
        Ok(())
    }
}

/// Park the post in the request ledger for a moderator
pub struct Hold;

#[async_trait]
impl Handler for Hold {
    fn name(&self) -> &'static str {
        "hold"
    }

    fn description(&self) -> &'static str {
        "Hold the message for moderator approval."
    }

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        let sender = msg.sender.clone().unwrap_or_default();
        let subject = msg.subject.clone().unwrap_or_else(|| "(no subject)".to_string());
        let reasons = reasons_text(msgdata);

        let mut data = Pendable::with_type(held::TYPE);
        data.insert(held::MSG, &*msg)?;
        data.insert(held::MSGDATA, &*msgdata)?;
        data.insert_str(held::SENDER, sender.as_str());
        data.insert_str(held::SUBJECT, subject.as_str());
        data.insert(held::REASONS, &msgdata.moderation_reasons)?;

        let ledger = ctx.requests.for_list(&list.list_id);
        let request_id = ledger
            .hold(RequestType::HeldMessage, &msg.key(), Some(data))
            .await?;

        // A post that will be retried must not stay held as well
        if let Err(e) = notify_held(ctx, list, request_id, &sender, &subject, &reasons).await {
            if let Err(undo) = ledger.resolve(request_id).await {
                warn!(list_id = %list.list_id, request_id, error = %undo, "Failed to drop held request");
            }
            return Err(e);
        }

        info!(
            list_id = %list.list_id,
            request_id,
            reasons = %reasons,
            "Post held for moderation"
        );
        Ok(())
    }
}

async fn notify_held(
    ctx: &Context,
    list: &MailingList,
    request_id: RequestId,
    sender: &str,
    subject: &str,
    reasons: &str,
) -> Result<()> {
    ctx.notifier
        .send(
            Notification::new(&list.list_id, &list.owner_address(), templates::POST_HELD)
                .with("request_id", request_id.to_string())
                .with("sender", sender)
                .with("subject", subject)
                .with("reasons", reasons),
        )
        .await?;

    if !sender.is_empty() {
        ctx.notifier
            .send(
                Notification::new(&list.list_id, sender, templates::POST_HELD_ACK)
                    .with("subject", subject)
                    .with("reasons", reasons),
            )
            .await?;
    }
    Ok(())
}

/// Bounce the post to its sender
pub struct Reject;

#[async_trait]
impl Handler for Reject {
    fn name(&self) -> &'static str {
        "reject"
    }

    fn description(&self) -> &'static str {
        "Reject the message and bounce it to the sender."
    }

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        let reasons = reasons_text(msgdata);
        if let Some(sender) = msg.sender.as_deref() {
            ctx.notifier
                .send(
                    Notification::new(&list.list_id, sender, templates::POST_REJECTED)
                        .with("subject", msg.subject.clone().unwrap_or_default())
                        .with("reasons", reasons.as_str()),
                )
                .await?;
        }
        info!(list_id = %list.list_id, reasons = %reasons, "Post rejected");
        Ok(())
    }
}

/// Drop the post silently
pub struct Discard;

#[async_trait]
impl Handler for Discard {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn description(&self) -> &'static str {
        "Discard the message without notice."
    }

    async fn process(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        _msgdata: &mut MessageData,
    ) -> Result<()> {
        info!(list_id = %list.list_id, message_id = ?msg.message_id, "Post discarded");
        Ok(())
    }
}

/// Add list headers and the subject prefix
pub struct CookHeaders;

#[async_trait]
impl Handler for CookHeaders {
    fn name(&self) -> &'static str {
        "cook-headers"
    }

    fn description(&self) -> &'static str {
        "Modify message headers."
    }

    async fn process(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        _msgdata: &mut MessageData,
    ) -> Result<()> {
        msg.add_header("X-BeenThere", list.list_id.as_str());
        msg.set_header("Precedence", "list");
        if let Some(address) = list.address() {
            msg.set_header("List-Id", format!("<{}.{}>", address.local, address.domain));
        }
        msg.set_header("List-Post", format!("<mailto:{}>", list.list_id));
        msg.set_header(
            "List-Unsubscribe",
            format!("<mailto:{}?subject=unsubscribe>", list.request_address()),
        );

        let prefix = format!("[{}] ", list.display_name);
        let subject = msg.subject.clone().unwrap_or_default();
        if !subject.contains(prefix.trim_end()) {
            let cooked = format!("{}{}", prefix, subject);
            msg.set_header("Subject", cooked.as_str());
            msg.subject = Some(cooked);
        }
        Ok(())
    }
}

/// Compute the delivery recipients from the list's regular members
pub struct CalculateRecipients;

#[async_trait]
impl Handler for CalculateRecipients {
    fn name(&self) -> &'static str {
        "calculate-recipients"
    }

    fn description(&self) -> &'static str {
        "Calculate the regular recipients of the message."
    }

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        _msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        let mut recipients: Vec<String> = ctx
            .repos
            .members
            .list(&list.list_id, Some(MemberRole::Member))
            .await?
            .into_iter()
            .filter(|m| m.delivery_mode_enum() == DeliveryMode::Regular)
            .map(|m| m.email)
            .collect();
        recipients.sort();
        recipients.dedup();
        msgdata.recipients = recipients;
        Ok(())
    }
}

/// Post bookkeeping: last post time and the post counter
pub struct AfterDelivery;

#[async_trait]
impl Handler for AfterDelivery {
    fn name(&self) -> &'static str {
        "after-delivery"
    }

    fn description(&self) -> &'static str {
        "Perform some bookkeeping after a successful post."
    }

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        _msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        let post_id = ctx
            .repos
            .lists
            .record_post(&list.list_id, ctx.clock.now())
            .await?;
        msgdata.post_id = Some(post_id);
        Ok(())
    }
}

/// Hand the post to the outgoing queue
pub struct ToOutgoing;

#[async_trait]
impl Handler for ToOutgoing {
    fn name(&self) -> &'static str {
        "to-outgoing"
    }

    fn description(&self) -> &'static str {
        "Send the message to the outgoing queue."
    }

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        ctx.queue
            .enqueue(
                OUT,
                &WorkItem::Message {
                    list_id: list.list_id.clone(),
                    msg: msg.clone(),
                    msgdata: msgdata.clone(),
                },
            )
            .await?;
        info!(
            list_id = %list.list_id,
            recipients = msgdata.recipients.len(),
            "Post queued for delivery"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{context, failing_context, test_list};
    use crate::message::tests::anne_post;
    use crate::queue::VIRGIN;
    use listrust_storage::CreateMember;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_hold_registers_request_and_notifies() {
        let ctx = context();
        let list = test_list(&ctx).await;
        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        msgdata.add_reason("Message has implicit destination");

        Hold.process(&ctx, &list, &mut msg, &mut msgdata).await.unwrap();

        let ledger = ctx.requests.for_list(&list.list_id);
        assert_eq!(ledger.count_of(RequestType::HeldMessage).await.unwrap(), 1);
        let held = ledger.held_requests().await.unwrap().remove(0);
        let entry = ledger.get(held.id, None).await.unwrap().unwrap();
        let data = entry.data.unwrap();
        assert_eq!(data.get::<Message>(held::MSG).unwrap(), Some(msg));
        assert_eq!(data.get_str(held::SENDER), Some("anne@example.com"));

        let notices = ctx.notifier.pending().await.unwrap();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].recipient, "test-owner@example.com");
        assert_eq!(notices[0].template, templates::POST_HELD);
        assert_eq!(notices[1].recipient, "anne@example.com");
    }

    #[tokio::test]
    async fn test_failed_hold_notice_leaves_nothing_held() {
        let (ctx, _clock) = failing_context(VIRGIN, 1, 1);
        let list = test_list(&ctx).await;
        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        msgdata.add_reason("Message has implicit destination");

        assert!(Hold.process(&ctx, &list, &mut msg, &mut msgdata).await.is_err());
        let ledger = ctx.requests.for_list(&list.list_id);
        assert_eq!(ledger.count().await.unwrap(), 0);

        Hold.process(&ctx, &list, &mut msg, &mut msgdata).await.unwrap();
        assert_eq!(ledger.count_of(RequestType::HeldMessage).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reject_bounces_to_sender() {
        let ctx = context();
        let list = test_list(&ctx).await;
        let mut msg = anne_post();
        Reject
            .process(&ctx, &list, &mut msg, &mut MessageData::default())
            .await
            .unwrap();

        let notices = ctx.notifier.pending().await.unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].template, templates::POST_REJECTED);
    }

    #[tokio::test]
    async fn test_cook_headers() {
        let ctx = context();
        let list = test_list(&ctx).await;
        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        CookHeaders.process(&ctx, &list, &mut msg, &mut msgdata).await.unwrap();

        assert_eq!(msg.subject.as_deref(), Some("[Test] Hello list"));
        assert_eq!(msg.header("List-Id"), Some("<test.example.com>"));
        assert!(msg.header_values("X-BeenThere").any(|v| v == "test@example.com"));

        // Prefix is added once
        CookHeaders.process(&ctx, &list, &mut msg, &mut msgdata).await.unwrap();
        assert_eq!(msg.subject.as_deref(), Some("[Test] Hello list"));
    }

    #[tokio::test]
    async fn test_delivery_pipeline_handlers() {
        let ctx = context();
        let list = test_list(&ctx).await;
        for (email, mode) in [
            ("bart@example.com", DeliveryMode::Regular),
            ("anne@example.com", DeliveryMode::Regular),
            ("cris@example.com", DeliveryMode::MimeDigests),
        ] {
            ctx.repos
                .members
                .add(CreateMember {
                    list_id: list.list_id.clone(),
                    email: email.to_string(),
                    role: MemberRole::Member,
                    display_name: None,
                    delivery_mode: mode,
                    preferred_language: None,
                })
                .await
                .unwrap();
        }

        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        CalculateRecipients
            .process(&ctx, &list, &mut msg, &mut msgdata)
            .await
            .unwrap();
        assert_eq!(msgdata.recipients, vec!["anne@example.com", "bart@example.com"]);

        AfterDelivery.process(&ctx, &list, &mut msg, &mut msgdata).await.unwrap();
        assert_eq!(msgdata.post_id, Some(2));

        ToOutgoing.process(&ctx, &list, &mut msg, &mut msgdata).await.unwrap();
        assert_eq!(ctx.queue.items(OUT).await.unwrap().len(), 1);
        assert!(ctx.queue.items(VIRGIN).await.unwrap().is_empty());
    }
}
