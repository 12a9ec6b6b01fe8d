//! Rules, handlers and the chains that compose them
//!
//! A posting chain runs its links' rules in order until one matches with a
//! terminal action, then fires that disposition's handler exactly once. A
//! pipeline runs its handlers in order over an accepted message.

pub mod handlers;
pub mod registry;
pub mod rules;

use crate::context::Context;
use crate::message::{Message, MessageData};
use async_trait::async_trait;
use listrust_common::Result;
use listrust_storage::MailingList;
use serde::{Deserialize, Serialize};

pub use registry::{Chain, ChainRegistry, Link, LinkAction, Pipeline};

/// A named predicate over a message. Must not change any state: it may be
/// evaluated more than once for the same message.
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Whether hits and misses are recorded in the message metadata
    fn record(&self) -> bool {
        true
    }

    async fn check(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &Message,
        msgdata: &MessageData,
    ) -> Result<bool>;
}

/// A named action over a message
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()>;
}

/// Terminal outcome of a posting chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accept,
    Hold,
    Reject,
    Discard,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Accept => "accept",
            Disposition::Hold => "hold",
            Disposition::Reject => "reject",
            Disposition::Discard => "discard",
        }
    }

    /// Name of the handler that carries out this disposition
    pub fn handler_name(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
