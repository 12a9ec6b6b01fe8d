//! Pending store - token-addressed, expiring payloads
//!
//! Tokens are 160 random bits from the OS generator, hex encoded. They carry
//! no information about the payload and are never sequential. Reads of an
//! absent or expired token are a normal `None`, not an error.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use listrust_common::types::Token;
use listrust_common::{Error, Result};
use listrust_storage::PendingRepository;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TOKEN_BYTES: usize = 20;
const MAX_TOKEN_ATTEMPTS: usize = 8;

/// Key under which a pendable's kind label is stored
pub const TYPE_KEY: &str = "type";

/// An ordered string-keyed mapping. Values are text or structured data,
/// which is serialised transparently and reconstituted by [`Pendable::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pendable(BTreeMap<String, serde_json::Value>);

impl Pendable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pendable labelled with a kind, e.g. `"subscription"`
    pub fn with_type(label: &str) -> Self {
        let mut pendable = Self::new();
        pendable.insert_str(TYPE_KEY, label);
        pendable
    }

    pub fn type_label(&self) -> Option<&str> {
        self.get_str(TYPE_KEY)
    }

    pub fn insert_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Store any serialisable value under `key`
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Internal(format!("Unpendable value: {}", e)))?;
        self.0.insert(key.into(), value);
        Ok(())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Reconstitute the value stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.0.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::Storage(format!("Malformed pended value {}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.0.into_iter().collect())
    }

    fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Storage(format!("Malformed pended record: {}", e)))
    }
}

/// Generate a fresh unguessable token
pub fn generate_token() -> Token {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The pending store
#[derive(Clone)]
pub struct Pendings {
    repo: Arc<dyn PendingRepository>,
    clock: Arc<dyn Clock>,
}

impl Pendings {
    pub fn new(repo: Arc<dyn PendingRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Persist `pendable` for `lifetime` under a new token
    pub async fn add(&self, pendable: Pendable, lifetime: Duration) -> Result<Token> {
        let payload = pendable.into_value();
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = generate_token();
            if self.insert(&token, payload.clone(), lifetime).await? {
                debug!(token = %token, lifetime_secs = lifetime.num_seconds(), "Pended record");
                return Ok(token);
            }
            warn!("Pending token collision, regenerating");
        }
        Err(Error::Internal(
            "Could not allocate a unique pending token".to_string(),
        ))
    }

    /// Persist `pendable` under a caller-chosen token. Returns `false` if
    /// the token is already in use.
    pub async fn put(&self, token: &str, pendable: Pendable, lifetime: Duration) -> Result<bool> {
        self.insert(token, pendable.into_value(), lifetime).await
    }

    /// Like [`Pendings::put`], but live only until `expires_at`
    pub async fn put_until(
        &self,
        token: &str,
        pendable: Pendable,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.repo
            .insert(token, pendable.into_value(), self.clock.now(), expires_at)
            .await
    }

    async fn insert(
        &self,
        token: &str,
        payload: serde_json::Value,
        lifetime: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        self.repo.insert(token, payload, now, now + lifetime).await
    }

    /// Consume a live record, returning it with its expiry so it can be put
    /// back unchanged
    pub async fn take(&self, token: &str) -> Result<Option<(Pendable, DateTime<Utc>)>> {
        match self.repo.take(token, self.clock.now()).await? {
            Some(record) => {
                let pendable = Pendable::from_value(record.payload)?;
                Ok(Some((pendable, record.expires_at)))
            }
            None => Ok(None),
        }
    }

    /// Look up a live record, deleting it if `expunge`. With `expunge`, of
    /// any number of concurrent callers at most one receives the payload.
    pub async fn confirm(&self, token: &str, expunge: bool) -> Result<Option<Pendable>> {
        let now = self.clock.now();
        let record = if expunge {
            self.repo.take(token, now).await?
        } else {
            self.repo.get(token, now).await?
        };

        match record {
            Some(record) => Pendable::from_value(record.payload).map(Some),
            None => {
                debug!(token = %token, "Pending token unknown or expired");
                Ok(None)
            }
        }
    }

    /// Non-destructive read
    pub async fn peek(&self, token: &str) -> Result<Option<Pendable>> {
        self.confirm(token, false).await
    }

    /// Drop every expired record
    pub async fn evict_expired(&self) -> Result<u64> {
        let evicted = self.repo.delete_expired(self.clock.now()).await?;
        if evicted > 0 {
            info!(evicted, "Evicted expired pending records");
        }
        Ok(evicted)
    }

    /// Number of stored records, including expired ones not yet evicted
    pub async fn count(&self) -> Result<u64> {
        self.repo.count().await
    }
}
