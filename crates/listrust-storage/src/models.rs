//! Database models

use chrono::{DateTime, Utc};
use listrust_common::config::ListConfig;
use listrust_common::types::{
    DeliveryMode, EmailAddress, ListId, MemberRole, RequestId, RequestType, SubscriptionPolicy,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A token-addressed, expiring payload
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PendedRecord {
    pub token: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendedRecord {
    /// Whether the record is still live at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// An entry in a list's request ledger
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HeldRequest {
    pub id: RequestId,
    pub list_id: ListId,
    pub request_type: String,
    pub key: String,
    pub data_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HeldRequest {
    /// Get request type enum
    pub fn request_type_enum(&self) -> Option<RequestType> {
        self.request_type.parse().ok()
    }
}

/// A known email address
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Address {
    /// Canonical (lowercased) form, used as the key
    pub email: String,
    /// The address as it was first given to us
    pub original_email: String,
    pub display_name: Option<String>,
    pub verified_on: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A membership of an address in a list, in some role
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub list_id: ListId,
    pub email: String,
    pub role: String,
    pub display_name: Option<String>,
    pub delivery_mode: String,
    pub preferred_language: Option<String>,
    pub subscribed_at: DateTime<Utc>,
}

impl Member {
    /// Get role enum
    pub fn role_enum(&self) -> MemberRole {
        self.role.parse().unwrap_or_default()
    }

    /// Get delivery mode enum
    pub fn delivery_mode_enum(&self) -> DeliveryMode {
        self.delivery_mode.parse().unwrap_or_default()
    }
}

/// Mailing list model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MailingList {
    pub list_id: ListId,
    pub display_name: String,
    pub subscription_policy: String,
    pub unsubscription_policy: String,
    pub posting_chain: String,
    pub posting_pipeline: String,
    pub send_welcome_message: bool,
    pub send_goodbye_message: bool,
    pub admin_notify_mchanges: bool,
    pub ban_patterns: serde_json::Value,
    pub max_message_size_kb: i64,
    pub max_num_recipients: i64,
    pub default_delivery_mode: String,
    pub post_id: i64,
    pub last_post_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MailingList {
    /// Get subscription policy enum
    pub fn subscription_policy_enum(&self) -> SubscriptionPolicy {
        self.subscription_policy.parse().unwrap_or_default()
    }

    /// Get unsubscription policy enum
    pub fn unsubscription_policy_enum(&self) -> SubscriptionPolicy {
        self.unsubscription_policy.parse().unwrap_or_default()
    }

    /// Get default delivery mode enum
    pub fn default_delivery_mode_enum(&self) -> DeliveryMode {
        self.default_delivery_mode.parse().unwrap_or_default()
    }

    /// Get ban patterns as a vector
    pub fn ban_patterns_vec(&self) -> Vec<String> {
        serde_json::from_value(self.ban_patterns.clone()).unwrap_or_default()
    }

    /// The posting address, split into parts
    pub fn address(&self) -> Option<EmailAddress> {
        EmailAddress::parse(&self.list_id)
    }

    /// `list-owner@domain`
    pub fn owner_address(&self) -> String {
        self.suffixed("owner")
    }

    /// `list-request@domain`
    pub fn request_address(&self) -> String {
        self.suffixed("request")
    }

    /// `list-bounces@domain`
    pub fn bounces_address(&self) -> String {
        self.suffixed("bounces")
    }

    /// `list-confirm+TOKEN@domain`, the reply address of a confirmation request
    pub fn confirm_address(&self, token: &str) -> String {
        match self.address() {
            Some(address) => format!("{}-confirm+{}@{}", address.local, token, address.domain),
            None => self.list_id.clone(),
        }
    }

    fn suffixed(&self, suffix: &str) -> String {
        match self.address() {
            Some(address) => address.with_suffix(suffix),
            None => self.list_id.clone(),
        }
    }
}

/// Settings for creating or updating a list
#[derive(Debug, Clone)]
pub struct ListSettings {
    pub display_name: String,
    pub subscription_policy: SubscriptionPolicy,
    pub unsubscription_policy: SubscriptionPolicy,
    pub posting_chain: String,
    pub posting_pipeline: String,
    pub send_welcome_message: bool,
    pub send_goodbye_message: bool,
    pub admin_notify_mchanges: bool,
    pub ban_patterns: Vec<String>,
    pub max_message_size_kb: i64,
    pub max_num_recipients: i64,
    pub default_delivery_mode: DeliveryMode,
}

impl ListSettings {
    /// Default settings with the given display name
    pub fn with_display_name(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            subscription_policy: SubscriptionPolicy::Open,
            unsubscription_policy: SubscriptionPolicy::Open,
            posting_chain: "default-posting-chain".to_string(),
            posting_pipeline: "default-posting-pipeline".to_string(),
            send_welcome_message: true,
            send_goodbye_message: true,
            admin_notify_mchanges: false,
            ban_patterns: Vec::new(),
            max_message_size_kb: 40,
            max_num_recipients: 10,
            default_delivery_mode: DeliveryMode::Regular,
        }
    }
}

impl From<&ListConfig> for ListSettings {
    fn from(config: &ListConfig) -> Self {
        let display_name = config.display_name.clone().unwrap_or_else(|| {
            let local = config.address.split('@').next().unwrap_or_default();
            capitalize(local)
        });

        Self {
            display_name,
            subscription_policy: config.subscription_policy,
            unsubscription_policy: config.unsubscription_policy,
            posting_chain: config.posting_chain.clone(),
            posting_pipeline: config.posting_pipeline.clone(),
            send_welcome_message: config.send_welcome_message,
            send_goodbye_message: config.send_goodbye_message,
            admin_notify_mchanges: config.admin_notify_mchanges,
            ban_patterns: config.ban_patterns.clone(),
            max_message_size_kb: config.max_message_size_kb,
            max_num_recipients: config.max_num_recipients,
            default_delivery_mode: config.default_delivery_mode,
        }
    }
}

/// `"test"` -> `"Test"`, the default display name of a list
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Job status values
pub mod job_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const FAILED: &str = "failed";
}

/// Name of the queue failed jobs are moved to
pub const BAD_QUEUE: &str = "bad";

/// A durable queue entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub shard: i32,
    /// Queue the job was in before it was moved to the error queue
    pub origin_queue: Option<String>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A runner's share of a queue: jobs with `shard % count == index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub index: u32,
    pub count: u32,
}

impl Slice {
    pub fn new(index: u32, count: u32) -> Self {
        Self { index, count }
    }

    /// Whether a shard value belongs to this slice
    pub fn contains(&self, shard: i32) -> bool {
        self.count <= 1 || (shard.unsigned_abs() % self.count) == self.index
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

/// Identity of a workflow: at most one live workflow per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub list_id: ListId,
    pub email: String,
    pub kind: String,
}

impl WorkflowKey {
    pub fn new(list_id: impl Into<String>, email: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            list_id: list_id.into(),
            email: email.into(),
            kind: kind.into(),
        }
    }
}

/// A live workflow claim
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowClaim {
    pub list_id: ListId,
    pub email: String,
    pub kind: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_list() -> MailingList {
        MailingList {
            list_id: "test@example.com".to_string(),
            display_name: "Test".to_string(),
            subscription_policy: "moderate".to_string(),
            unsubscription_policy: "bogus".to_string(),
            posting_chain: "default-posting-chain".to_string(),
            posting_pipeline: "default-posting-pipeline".to_string(),
            send_welcome_message: true,
            send_goodbye_message: true,
            admin_notify_mchanges: false,
            ban_patterns: serde_json::json!(["spam@example.org"]),
            max_message_size_kb: 40,
            max_num_recipients: 10,
            default_delivery_mode: "regular".to_string(),
            post_id: 1,
            last_post_time: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_list_addresses() {
        let list = test_list();
        assert_eq!(list.owner_address(), "test-owner@example.com");
        assert_eq!(list.request_address(), "test-request@example.com");
        assert_eq!(list.confirm_address("abc"), "test-confirm+abc@example.com");
    }

    #[test]
    fn test_list_enums() {
        let list = test_list();
        assert_eq!(list.subscription_policy_enum(), SubscriptionPolicy::Moderate);
        // Unknown values fall back to the default
        assert_eq!(list.unsubscription_policy_enum(), SubscriptionPolicy::Open);
        assert_eq!(list.ban_patterns_vec(), vec!["spam@example.org"]);
    }

    #[test]
    fn test_slice_contains() {
        let whole = Slice::new(0, 1);
        assert!(whole.contains(7));

        let first = Slice::new(0, 2);
        let second = Slice::new(1, 2);
        assert!(first.contains(4));
        assert!(!second.contains(4));
        assert!(second.contains(5));
    }

    #[test]
    fn test_settings_from_list_config() {
        let config: ListConfig = toml::from_str(r#"address = "ant@example.com""#).unwrap();
        let settings = ListSettings::from(&config);
        assert_eq!(settings.display_name, "Ant");
        assert_eq!(settings.posting_chain, "default-posting-chain");
    }
}
