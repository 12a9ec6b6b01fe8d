//! Adding and removing list members

use crate::chain::rules::is_banned;
use crate::context::Context;
use crate::notify::{templates, Notification};
use listrust_common::types::{DeliveryMode, EmailAddress, MemberRole};
use listrust_common::{Error, Result};
use listrust_storage::{CreateAddress, CreateMember, MailingList, Member};
use tracing::info;

/// Who to subscribe, and how
#[derive(Debug, Clone)]
pub struct NewMember {
    pub email: String,
    pub display_name: Option<String>,
    pub role: MemberRole,
    /// Defaults to the list's delivery mode
    pub delivery_mode: Option<DeliveryMode>,
    pub preferred_language: Option<String>,
}

impl NewMember {
    pub fn member(email: &str) -> Self {
        Self {
            email: email.to_string(),
            display_name: None,
            role: MemberRole::Member,
            delivery_mode: None,
            preferred_language: None,
        }
    }

    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name;
        self
    }

    pub fn with_role(mut self, role: MemberRole) -> Self {
        self.role = role;
        self
    }
}

/// Parse and lowercase an address
pub fn canonical_email(email: &str) -> Result<String> {
    EmailAddress::parse(email)
        .map(|a| a.canonical())
        .ok_or_else(|| Error::InvalidEmail(email.to_string()))
}

/// Subscribe an address to a list
///
/// Banned addresses are refused. The address record is created on first use.
/// Regular members get a welcome message when the list sends them, and the
/// owners hear about it when the list notifies on membership changes.
pub async fn add_member(ctx: &Context, list: &MailingList, new: NewMember) -> Result<Member> {
    let email = canonical_email(&new.email)?;
    if is_banned(&list.ban_patterns_vec(), &email) {
        return Err(Error::MembershipBanned {
            list_id: list.list_id.clone(),
            email,
        });
    }

    ctx.repos
        .addresses
        .get_or_create(CreateAddress {
            email: email.clone(),
            original_email: new.email.trim().to_string(),
            display_name: new.display_name.clone(),
        })
        .await?;

    let member = ctx
        .repos
        .members
        .add(CreateMember {
            list_id: list.list_id.clone(),
            email: email.clone(),
            role: new.role,
            display_name: new.display_name.clone(),
            delivery_mode: new
                .delivery_mode
                .unwrap_or_else(|| list.default_delivery_mode_enum()),
            preferred_language: new.preferred_language,
        })
        .await?;

    if new.role == MemberRole::Member {
        if list.send_welcome_message {
            ctx.notifier
                .send(
                    Notification::new(&list.list_id, &email, templates::WELCOME)
                        .with("display_name", list.display_name.as_str())
                        .with("request_address", list.request_address()),
                )
                .await?;
        }
        if list.admin_notify_mchanges {
            ctx.notifier
                .send(
                    Notification::new(&list.list_id, &list.owner_address(), templates::ADMIN_SUBSCRIBED)
                        .with("member", email.as_str()),
                )
                .await?;
        }
    }

    info!(list_id = %list.list_id, email = %email, role = new.role.as_str(), "Member added");
    Ok(member)
}

/// Unsubscribe a regular member
pub async fn delete_member(ctx: &Context, list: &MailingList, email: &str) -> Result<()> {
    let email = canonical_email(email)?;
    let removed = ctx
        .repos
        .members
        .delete(&list.list_id, &email, MemberRole::Member)
        .await?;
    if !removed {
        return Err(Error::NotAMember {
            list_id: list.list_id.clone(),
            email,
        });
    }

    if list.send_goodbye_message {
        ctx.notifier
            .send(
                Notification::new(&list.list_id, &email, templates::GOODBYE)
                    .with("display_name", list.display_name.as_str()),
            )
            .await?;
    }
    if list.admin_notify_mchanges {
        ctx.notifier
            .send(
                Notification::new(&list.list_id, &list.owner_address(), templates::ADMIN_UNSUBSCRIBED)
                    .with("member", email.as_str()),
            )
            .await?;
    }

    info!(list_id = %list.list_id, email = %email, "Member removed");
    Ok(())
}
