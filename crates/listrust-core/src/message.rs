//! Decoded message and its processing metadata

use listrust_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A decoded inbound message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    /// Text headers in message order
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Size in bytes of the raw message
    pub size: usize,
}

impl Message {
    /// Parse a raw RFC 5322 message
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let parsed = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Validation("Failed to parse message".to_string()))?;

        let sender = parsed
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .map(|s| s.to_lowercase());

        let headers = parsed
            .headers()
            .iter()
            .filter_map(|h| {
                h.value()
                    .as_text()
                    .map(|v| (h.name().to_string(), v.trim().to_string()))
            })
            .collect();

        Ok(Self {
            message_id: parsed.message_id().map(|s| s.to_string()),
            sender,
            to: addresses(parsed.to()),
            cc: addresses(parsed.cc()),
            subject: parsed.subject().map(|s| s.to_string()),
            headers,
            body: parsed
                .body_text(0)
                .map(|s| s.to_string())
                .unwrap_or_default(),
            size: raw.len(),
        })
    }

    /// First value of a header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Replace every occurrence of a header with a single value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.add_header(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Explicit recipients: To and Cc
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(self.cc.iter()).map(String::as_str)
    }

    /// The key used for shard hashing and ledger entries
    pub fn key(&self) -> String {
        self.message_id
            .clone()
            .or_else(|| self.sender.clone())
            .unwrap_or_default()
    }
}

fn addresses(header: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    header
        .map(|a| {
            a.iter()
                .filter_map(|addr| addr.address())
                .map(|s| s.to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Mutable metadata carried with a message through chains and pipelines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    /// Names of recording rules that matched, in evaluation order
    #[serde(default)]
    pub rule_hits: Vec<String>,
    /// Names of recording rules that did not match
    #[serde(default)]
    pub rule_misses: Vec<String>,
    #[serde(default)]
    pub moderation_reasons: Vec<String>,
    /// Delivery recipients, computed by the pipeline
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Set once a moderator approved the message; chains skip moderation
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub post_id: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MessageData {
    pub fn record_hit(&mut self, rule: &str) {
        self.rule_hits.push(rule.to_string());
    }

    pub fn record_miss(&mut self, rule: &str) {
        self.rule_misses.push(rule.to_string());
    }

    pub fn add_reason(&mut self, reason: impl Into<String>) {
        self.moderation_reasons.push(reason.into());
    }
}
