//! Request ledger - per-list registry of items awaiting moderator action
//!
//! The ledger row is small and enumerable. Its payload lives in the pending
//! store under `data_token`, so listing never touches the payloads.

use crate::pending::{Pendable, Pendings};
use chrono::Duration;
use listrust_common::types::{RequestId, RequestType};
use listrust_common::Result;
use listrust_storage::{CreateRequest, HeldRequest, RequestRepository};
use std::sync::Arc;
use tracing::{debug, info};

/// Key added to fetched data naming the request's kind
pub const REQUEST_TYPE_KEY: &str = "_request_type";

/// A fetched ledger entry
#[derive(Debug, Clone, PartialEq)]
pub struct HeldEntry {
    pub id: RequestId,
    pub request_type: RequestType,
    pub key: String,
    /// `None` for requests held without data
    pub data: Option<Pendable>,
}

/// Request ledger, shared by every list
#[derive(Clone)]
pub struct Requests {
    repo: Arc<dyn RequestRepository>,
    pendings: Pendings,
    lifetime: Duration,
}

impl Requests {
    /// `lifetime` is how long held payloads are kept
    pub fn new(repo: Arc<dyn RequestRepository>, pendings: Pendings, lifetime: Duration) -> Self {
        Self {
            repo,
            pendings,
            lifetime,
        }
    }

    /// The ledger of one list
    pub fn for_list(&self, list_id: &str) -> ListRequests {
        ListRequests {
            list_id: list_id.to_string(),
            repo: self.repo.clone(),
            pendings: self.pendings.clone(),
            lifetime: self.lifetime,
        }
    }
}

/// The ledger of a single mailing list
#[derive(Clone)]
pub struct ListRequests {
    list_id: String,
    repo: Arc<dyn RequestRepository>,
    pendings: Pendings,
    lifetime: Duration,
}

impl ListRequests {
    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    /// Register a held item, storing `data` in the pending store
    pub async fn hold(
        &self,
        request_type: RequestType,
        key: &str,
        data: Option<Pendable>,
    ) -> Result<RequestId> {
        let data_token = match data {
            Some(data) => Some(self.pendings.add(data, self.lifetime).await?),
            None => None,
        };

        let request = self
            .repo
            .insert(CreateRequest {
                list_id: self.list_id.clone(),
                request_type,
                key: key.to_string(),
                data_token,
            })
            .await?;

        info!(
            list_id = %self.list_id,
            request_id = request.id,
            request_type = %request_type,
            "Request held"
        );
        Ok(request.id)
    }

    /// Fetch an entry with its data. `None` if the id is unknown, is of a
    /// different kind than `request_type`, or its data has vanished.
    pub async fn get(
        &self,
        id: RequestId,
        request_type: Option<RequestType>,
    ) -> Result<Option<HeldEntry>> {
        let Some(request) = self.repo.get(&self.list_id, id).await? else {
            return Ok(None);
        };
        let Some(kind) = request.request_type_enum() else {
            return Ok(None);
        };
        if request_type.is_some_and(|rt| rt != kind) {
            return Ok(None);
        }

        let data = match &request.data_token {
            None => None,
            Some(token) => match self.pendings.peek(token).await? {
                Some(mut data) => {
                    data.insert_str(REQUEST_TYPE_KEY, kind.as_str());
                    Some(data)
                }
                None => {
                    debug!(list_id = %self.list_id, request_id = id, "Held request data is gone");
                    return Ok(None);
                }
            },
        };

        Ok(Some(HeldEntry {
            id: request.id,
            request_type: kind,
            key: request.key,
            data,
        }))
    }

    /// Entries of one kind, oldest first
    pub async fn of_type(&self, request_type: RequestType) -> Result<Vec<HeldRequest>> {
        self.repo.list(&self.list_id, Some(request_type)).await
    }

    /// Every entry, oldest first
    pub async fn held_requests(&self) -> Result<Vec<HeldRequest>> {
        self.repo.list(&self.list_id, None).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.repo.count(&self.list_id, None).await
    }

    pub async fn count_of(&self, request_type: RequestType) -> Result<u64> {
        self.repo.count(&self.list_id, Some(request_type)).await
    }

    /// Delete an entry and its data. The first call returns the removed
    /// entry; later calls, or calls racing a winner, return `None`.
    pub async fn resolve(&self, id: RequestId) -> Result<Option<HeldRequest>> {
        let Some(request) = self.repo.delete(&self.list_id, id).await? else {
            debug!(list_id = %self.list_id, request_id = id, "Request already resolved");
            return Ok(None);
        };

        if let Some(token) = &request.data_token {
            self.pendings.confirm(token, true).await?;
        }

        info!(list_id = %self.list_id, request_id = id, "Request resolved");
        Ok(Some(request))
    }
}
