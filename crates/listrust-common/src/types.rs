//! Common types for ListRust

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fully qualified posting address of a mailing list, e.g. `test@example.com`
pub type ListId = String;

/// Identifier of an entry in a list's request ledger
pub type RequestId = i64;

/// Opaque token addressing a pending record
pub type Token = String;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into().to_lowercase(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
            return None;
        }
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() || local.contains('@') {
            return None;
        }
        if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// The address in the canonical form used as a storage key
    pub fn canonical(&self) -> String {
        format!("{}@{}", self.local.to_lowercase(), self.domain)
    }

    /// The `-suffix` address of the same list, e.g. `test-owner@example.com`
    pub fn with_suffix(&self, suffix: &str) -> String {
        format!("{}-{}@{}", self.local, suffix, self.domain)
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::InvalidEmail(s.to_string()))
    }
}

/// Kinds of items held for moderator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Subscription,
    Unsubscription,
    HeldMessage,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Subscription => "subscription",
            RequestType::Unsubscription => "unsubscription",
            RequestType::HeldMessage => "held_message",
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(RequestType::Subscription),
            "unsubscription" => Ok(RequestType::Unsubscription),
            "held_message" => Ok(RequestType::HeldMessage),
            other => Err(crate::Error::Validation(format!(
                "unknown request type: {}",
                other
            ))),
        }
    }
}

/// Whether a moderator must approve (un)subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPolicy {
    #[default]
    Open,
    Moderate,
}

impl SubscriptionPolicy {
    pub fn requires_approval(&self) -> bool {
        matches!(self, SubscriptionPolicy::Moderate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPolicy::Open => "open",
            SubscriptionPolicy::Moderate => "moderate",
        }
    }
}

impl std::str::FromStr for SubscriptionPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SubscriptionPolicy::Open),
            "moderate" => Ok(SubscriptionPolicy::Moderate),
            other => Err(crate::Error::Validation(format!(
                "unknown subscription policy: {}",
                other
            ))),
        }
    }
}

/// Membership role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    #[default]
    Member,
    Owner,
    Moderator,
    Nonmember,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Member => "member",
            MemberRole::Owner => "owner",
            MemberRole::Moderator => "moderator",
            MemberRole::Nonmember => "nonmember",
        }
    }
}

impl std::str::FromStr for MemberRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(MemberRole::Member),
            "owner" => Ok(MemberRole::Owner),
            "moderator" => Ok(MemberRole::Moderator),
            "nonmember" => Ok(MemberRole::Nonmember),
            other => Err(crate::Error::Validation(format!("unknown role: {}", other))),
        }
    }
}

/// How a member receives list traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Regular,
    PlaintextDigests,
    MimeDigests,
    SummaryDigests,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Regular => "regular",
            DeliveryMode::PlaintextDigests => "plaintext_digests",
            DeliveryMode::MimeDigests => "mime_digests",
            DeliveryMode::SummaryDigests => "summary_digests",
        }
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(DeliveryMode::Regular),
            "plaintext_digests" => Ok(DeliveryMode::PlaintextDigests),
            "mime_digests" => Ok(DeliveryMode::MimeDigests),
            "summary_digests" => Ok(DeliveryMode::SummaryDigests),
            other => Err(crate::Error::Validation(format!(
                "unknown delivery mode: {}",
                other
            ))),
        }
    }
}
