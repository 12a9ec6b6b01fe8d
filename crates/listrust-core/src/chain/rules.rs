//! Built-in rules

use super::{Context, Rule};
use crate::message::{Message, MessageData};
use async_trait::async_trait;
use listrust_common::types::MemberRole;
use listrust_common::Result;
use listrust_storage::MailingList;
use regex::RegexBuilder;
use std::sync::Arc;
use tracing::warn;

/// Words that mark a message as a command rather than a post
const ADMINISTRIVIA: &[&str] = &[
    "confirm",
    "echo",
    "end",
    "help",
    "info",
    "join",
    "leave",
    "lists",
    "options",
    "remove",
    "set",
    "subscribe",
    "unsubscribe",
    "who",
];

/// How many non-blank body lines are scanned for commands
const ADMINISTRIVIA_BODY_LINES: usize = 5;

/// Every built-in rule
pub fn builtin() -> Vec<Arc<dyn Rule>> {
    vec![
        Arc::new(Truth),
        Arc::new(Any),
        Arc::new(Loop),
        Arc::new(BannedAddress),
        Arc::new(ImplicitDest),
        Arc::new(MaxRecipients),
        Arc::new(MaxSize),
        Arc::new(Administrivia),
        Arc::new(NoSubject),
        Arc::new(SpamFlag),
        Arc::new(NonmemberModeration),
    ]
}

/// Matches everything; the fallback at the end of every chain
pub struct Truth;

#[async_trait]
impl Rule for Truth {
    fn name(&self) -> &'static str {
        "truth"
    }

    fn description(&self) -> &'static str {
        "A rule which always matches."
    }

    fn record(&self) -> bool {
        false
    }

    async fn check(
        &self,
        _ctx: &Context,
        _list: &MailingList,
        _msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Matches if any earlier recording rule matched
pub struct Any;

#[async_trait]
impl Rule for Any {
    fn name(&self) -> &'static str {
        "any"
    }

    fn description(&self) -> &'static str {
        "Look for any previous rule hit."
    }

    fn record(&self) -> bool {
        false
    }

    async fn check(
        &self,
        _ctx: &Context,
        _list: &MailingList,
        _msg: &Message,
        msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(!msgdata.rule_hits.is_empty())
    }
}

/// The message has already been through this list
pub struct Loop;

#[async_trait]
impl Rule for Loop {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn description(&self) -> &'static str {
        "Look for a posting loop."
    }

    async fn check(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(msg
            .header_values("X-BeenThere")
            .any(|v| v.eq_ignore_ascii_case(&list.list_id)))
    }
}

/// The sender matches one of the list's ban patterns
pub struct BannedAddress;

/// Whether `email` is banned by `patterns`. A pattern starting with `^` is a
/// case-insensitive regular expression; anything else is an exact address.
pub fn is_banned(patterns: &[String], email: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.starts_with('^') {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => re.is_match(email),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Ignoring invalid ban pattern");
                    false
                }
            }
        } else {
            pattern.eq_ignore_ascii_case(email)
        }
    })
}

#[async_trait]
impl Rule for BannedAddress {
    fn name(&self) -> &'static str {
        "banned-address"
    }

    fn description(&self) -> &'static str {
        "Match messages sent by banned addresses."
    }

    async fn check(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(msg
            .sender
            .as_deref()
            .is_some_and(|sender| is_banned(&list.ban_patterns_vec(), sender)))
    }
}

/// The list is not an explicit recipient
pub struct ImplicitDest;

#[async_trait]
impl Rule for ImplicitDest {
    fn name(&self) -> &'static str {
        "implicit-dest"
    }

    fn description(&self) -> &'static str {
        "Catch messages with implicit destination."
    }

    async fn check(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(!msg
            .recipients()
            .any(|r| r.eq_ignore_ascii_case(&list.list_id)))
    }
}

pub struct MaxRecipients;

#[async_trait]
impl Rule for MaxRecipients {
    fn name(&self) -> &'static str {
        "max-recipients"
    }

    fn description(&self) -> &'static str {
        "Catch messages with too many explicit recipients."
    }

    async fn check(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        if list.max_num_recipients <= 0 {
            return Ok(false);
        }
        Ok(msg.recipients().count() as i64 >= list.max_num_recipients)
    }
}

pub struct MaxSize;

#[async_trait]
impl Rule for MaxSize {
    fn name(&self) -> &'static str {
        "max-size"
    }

    fn description(&self) -> &'static str {
        "Catch messages that are bigger than a specified maximum."
    }

    async fn check(
        &self,
        _ctx: &Context,
        list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        if list.max_message_size_kb <= 0 {
            return Ok(false);
        }
        Ok(msg.size as f64 / 1024.0 > list.max_message_size_kb as f64)
    }
}

/// A command sent to the posting address by mistake
pub struct Administrivia;

fn is_command(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|word| word.to_lowercase())
        .is_some_and(|word| ADMINISTRIVIA.contains(&word.as_str()))
}

#[async_trait]
impl Rule for Administrivia {
    fn name(&self) -> &'static str {
        "administrivia"
    }

    fn description(&self) -> &'static str {
        "Catch mis-addressed email commands."
    }

    async fn check(
        &self,
        _ctx: &Context,
        _list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        if msg.subject.as_deref().is_some_and(is_command) {
            return Ok(true);
        }
        Ok(msg
            .body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(ADMINISTRIVIA_BODY_LINES)
            .any(is_command))
    }
}

pub struct NoSubject;

#[async_trait]
impl Rule for NoSubject {
    fn name(&self) -> &'static str {
        "no-subject"
    }

    fn description(&self) -> &'static str {
        "Catch messages with no, or empty, Subject headers."
    }

    async fn check(
        &self,
        _ctx: &Context,
        _list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(msg.subject.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

/// An upstream filter flagged the message as spam
pub struct SpamFlag;

#[async_trait]
impl Rule for SpamFlag {
    fn name(&self) -> &'static str {
        "spam-flag"
    }

    fn description(&self) -> &'static str {
        "Match messages flagged as spam by an upstream filter."
    }

    async fn check(
        &self,
        _ctx: &Context,
        _list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        Ok(msg
            .header_values("X-Spam-Flag")
            .any(|v| v.eq_ignore_ascii_case("yes")))
    }
}

/// The sender holds no posting role on the list
pub struct NonmemberModeration;

#[async_trait]
impl Rule for NonmemberModeration {
    fn name(&self) -> &'static str {
        "nonmember-moderation"
    }

    fn description(&self) -> &'static str {
        "Match messages sent by nonmembers."
    }

    async fn check(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &Message,
        _msgdata: &MessageData,
    ) -> Result<bool> {
        let Some(sender) = msg.sender.as_deref() else {
            return Ok(true);
        };
        for role in [MemberRole::Member, MemberRole::Owner, MemberRole::Moderator] {
            if ctx.repos.members.get(&list.list_id, sender, role).await?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
