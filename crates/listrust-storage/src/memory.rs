//! In-memory repositories
//!
//! Same contracts as the database repositories, backed by maps behind a
//! mutex. Used by the `memory` backend and by tests.

use crate::models::{
    job_status, Address, HeldRequest, Job, ListSettings, MailingList, Member, PendedRecord,
    QueueStats, Slice, WorkflowClaim, WorkflowKey, BAD_QUEUE,
};
use crate::repository::{
    AddressRepository, CreateAddress, CreateJob, CreateMember, CreateRequest, JobRepository,
    ListRepository, MemberRepository, PendingRepository, RequestRepository, WorkflowRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listrust_common::types::{MemberRole, RequestId, RequestType};
use listrust_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-memory pending record repository
#[derive(Default)]
pub struct MemoryPendingRepository {
    records: Mutex<HashMap<String, PendedRecord>>,
}

impl MemoryPendingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingRepository for MemoryPendingRepository {
    async fn insert(
        &self,
        token: &str,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.lock().await;
        if records.contains_key(token) {
            return Ok(false);
        }
        records.insert(
            token.to_string(),
            PendedRecord {
                token: token.to_string(),
                payload,
                created_at,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn get(&self, token: &str, now: DateTime<Utc>) -> Result<Option<PendedRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(token).filter(|r| r.is_live(now)).cloned())
    }

    async fn take(&self, token: &str, now: DateTime<Utc>) -> Result<Option<PendedRecord>> {
        let mut records = self.records.lock().await;
        match records.get(token) {
            Some(record) if record.is_live(now) => Ok(records.remove(token)),
            _ => Ok(None),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        Ok((before - records.len()) as u64)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.lock().await.len() as u64)
    }
}

#[derive(Default)]
struct RequestTable {
    next_id: RequestId,
    rows: BTreeMap<RequestId, HeldRequest>,
}

/// In-memory request ledger repository
#[derive(Default)]
pub struct MemoryRequestRepository {
    table: Mutex<RequestTable>,
}

impl MemoryRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestRepository for MemoryRequestRepository {
    async fn insert(&self, input: CreateRequest) -> Result<HeldRequest> {
        let mut table = self.table.lock().await;
        table.next_id += 1;
        let request = HeldRequest {
            id: table.next_id,
            list_id: input.list_id,
            request_type: input.request_type.as_str().to_string(),
            key: input.key,
            data_token: input.data_token,
            created_at: Utc::now(),
        };
        table.rows.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, list_id: &str, id: RequestId) -> Result<Option<HeldRequest>> {
        let table = self.table.lock().await;
        Ok(table.rows.get(&id).filter(|r| r.list_id == list_id).cloned())
    }

    async fn list(
        &self,
        list_id: &str,
        request_type: Option<RequestType>,
    ) -> Result<Vec<HeldRequest>> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .values()
            .filter(|r| r.list_id == list_id)
            .filter(|r| request_type.map_or(true, |rt| r.request_type == rt.as_str()))
            .cloned()
            .collect())
    }

    async fn count(&self, list_id: &str, request_type: Option<RequestType>) -> Result<u64> {
        Ok(self.list(list_id, request_type).await?.len() as u64)
    }

    async fn delete(&self, list_id: &str, id: RequestId) -> Result<Option<HeldRequest>> {
        let mut table = self.table.lock().await;
        match table.rows.get(&id) {
            Some(r) if r.list_id == list_id => Ok(table.rows.remove(&id)),
            _ => Ok(None),
        }
    }
}

/// In-memory address repository
#[derive(Default)]
pub struct MemoryAddressRepository {
    addresses: Mutex<HashMap<String, Address>>,
}

impl MemoryAddressRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AddressRepository for MemoryAddressRepository {
    async fn get(&self, email: &str) -> Result<Option<Address>> {
        Ok(self.addresses.lock().await.get(email).cloned())
    }

    async fn get_or_create(&self, input: CreateAddress) -> Result<Address> {
        let mut addresses = self.addresses.lock().await;
        let address = addresses
            .entry(input.email.clone())
            .or_insert_with(|| Address {
                email: input.email,
                original_email: input.original_email,
                display_name: input.display_name,
                verified_on: None,
                created_at: Utc::now(),
            });
        Ok(address.clone())
    }

    async fn set_verified(&self, email: &str, verified_on: DateTime<Utc>) -> Result<()> {
        if let Some(address) = self.addresses.lock().await.get_mut(email) {
            address.verified_on = Some(verified_on);
        }
        Ok(())
    }
}

/// In-memory membership repository
#[derive(Default)]
pub struct MemoryMemberRepository {
    members: Mutex<Vec<Member>>,
}

impl MemoryMemberRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_member(m: &Member, list_id: &str, email: &str, role: MemberRole) -> bool {
    m.list_id == list_id && m.email == email && m.role == role.as_str()
}

#[async_trait]
impl MemberRepository for MemoryMemberRepository {
    async fn add(&self, input: CreateMember) -> Result<Member> {
        let mut members = self.members.lock().await;
        if members
            .iter()
            .any(|m| same_member(m, &input.list_id, &input.email, input.role))
        {
            return Err(Error::AlreadySubscribed {
                list_id: input.list_id,
                email: input.email,
            });
        }

        let member = Member {
            id: Uuid::now_v7(),
            list_id: input.list_id,
            email: input.email,
            role: input.role.as_str().to_string(),
            display_name: input.display_name,
            delivery_mode: input.delivery_mode.as_str().to_string(),
            preferred_language: input.preferred_language,
            subscribed_at: Utc::now(),
        };
        members.push(member.clone());
        Ok(member)
    }

    async fn get(&self, list_id: &str, email: &str, role: MemberRole) -> Result<Option<Member>> {
        let members = self.members.lock().await;
        Ok(members
            .iter()
            .find(|m| same_member(m, list_id, email, role))
            .cloned())
    }

    async fn list(&self, list_id: &str, role: Option<MemberRole>) -> Result<Vec<Member>> {
        let members = self.members.lock().await;
        Ok(members
            .iter()
            .filter(|m| m.list_id == list_id)
            .filter(|m| role.map_or(true, |r| m.role == r.as_str()))
            .cloned()
            .collect())
    }

    async fn delete(&self, list_id: &str, email: &str, role: MemberRole) -> Result<bool> {
        let mut members = self.members.lock().await;
        let before = members.len();
        members.retain(|m| !same_member(m, list_id, email, role));
        Ok(members.len() < before)
    }

    async fn delete_all(&self, list_id: &str) -> Result<u64> {
        let mut members = self.members.lock().await;
        let before = members.len();
        members.retain(|m| m.list_id != list_id);
        Ok((before - members.len()) as u64)
    }
}

/// In-memory mailing list repository
#[derive(Default)]
pub struct MemoryListRepository {
    lists: Mutex<BTreeMap<String, MailingList>>,
}

impl MemoryListRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_settings(list: &mut MailingList, settings: ListSettings) {
    list.display_name = settings.display_name;
    list.subscription_policy = settings.subscription_policy.as_str().to_string();
    list.unsubscription_policy = settings.unsubscription_policy.as_str().to_string();
    list.posting_chain = settings.posting_chain;
    list.posting_pipeline = settings.posting_pipeline;
    list.send_welcome_message = settings.send_welcome_message;
    list.send_goodbye_message = settings.send_goodbye_message;
    list.admin_notify_mchanges = settings.admin_notify_mchanges;
    list.ban_patterns = serde_json::json!(settings.ban_patterns);
    list.max_message_size_kb = settings.max_message_size_kb;
    list.max_num_recipients = settings.max_num_recipients;
    list.default_delivery_mode = settings.default_delivery_mode.as_str().to_string();
}

#[async_trait]
impl ListRepository for MemoryListRepository {
    async fn create(&self, list_id: &str, settings: ListSettings) -> Result<MailingList> {
        let mut lists = self.lists.lock().await;
        if lists.contains_key(list_id) {
            return Err(Error::ListAlreadyExists(list_id.to_string()));
        }

        let mut list = MailingList {
            list_id: list_id.to_string(),
            display_name: String::new(),
            subscription_policy: String::new(),
            unsubscription_policy: String::new(),
            posting_chain: String::new(),
            posting_pipeline: String::new(),
            send_welcome_message: true,
            send_goodbye_message: true,
            admin_notify_mchanges: false,
            ban_patterns: serde_json::json!([]),
            max_message_size_kb: 0,
            max_num_recipients: 0,
            default_delivery_mode: String::new(),
            post_id: 1,
            last_post_time: None,
            created_at: Utc::now(),
        };
        apply_settings(&mut list, settings);
        lists.insert(list_id.to_string(), list.clone());
        Ok(list)
    }

    async fn get(&self, list_id: &str) -> Result<Option<MailingList>> {
        Ok(self.lists.lock().await.get(list_id).cloned())
    }

    async fn list(&self) -> Result<Vec<MailingList>> {
        Ok(self.lists.lock().await.values().cloned().collect())
    }

    async fn update_settings(&self, list_id: &str, settings: ListSettings) -> Result<MailingList> {
        let mut lists = self.lists.lock().await;
        let list = lists
            .get_mut(list_id)
            .ok_or_else(|| Error::NotFound(format!("list {}", list_id)))?;
        apply_settings(list, settings);
        Ok(list.clone())
    }

    async fn record_post(&self, list_id: &str, at: DateTime<Utc>) -> Result<i64> {
        let mut lists = self.lists.lock().await;
        let list = lists
            .get_mut(list_id)
            .ok_or_else(|| Error::NotFound(format!("list {}", list_id)))?;
        list.post_id += 1;
        list.last_post_time = Some(at);
        Ok(list.post_id)
    }

    async fn delete(&self, list_id: &str) -> Result<bool> {
        Ok(self.lists.lock().await.remove(list_id).is_some())
    }
}

/// In-memory workflow index repository
#[derive(Default)]
pub struct MemoryWorkflowRepository {
    claims: Mutex<HashMap<WorkflowKey, WorkflowClaim>>,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryWorkflowRepository {
    async fn claim(
        &self,
        key: &WorkflowKey,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut claims = self.claims.lock().await;
        if claims.get(key).is_some_and(|c| c.expires_at > now) {
            return Ok(false);
        }
        claims.insert(
            key.clone(),
            WorkflowClaim {
                list_id: key.list_id.clone(),
                email: key.email.clone(),
                kind: key.kind.clone(),
                token: token.to_string(),
                expires_at,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn find(&self, key: &WorkflowKey, now: DateTime<Utc>) -> Result<Option<WorkflowClaim>> {
        let claims = self.claims.lock().await;
        Ok(claims.get(key).filter(|c| c.expires_at > now).cloned())
    }

    async fn reassign(
        &self,
        key: &WorkflowKey,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut claims = self.claims.lock().await;
        match claims.get_mut(key) {
            Some(claim) if claim.token == old_token => {
                claim.token = new_token.to_string();
                claim.expires_at = expires_at;
                claim.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &WorkflowKey, token: &str) -> Result<bool> {
        let mut claims = self.claims.lock().await;
        if claims.get(key).is_some_and(|c| c.token == token) {
            claims.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut claims = self.claims.lock().await;
        let before = claims.len();
        claims.retain(|_, c| c.expires_at > now);
        Ok((before - claims.len()) as u64)
    }
}

/// In-memory job queue repository
#[derive(Default)]
pub struct MemoryJobRepository {
    // Insertion order doubles as the creation-order tie breaker
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(&self, input: CreateJob) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            queue: input.queue,
            payload: input.payload,
            status: job_status::PENDING.to_string(),
            attempts: 0,
            max_attempts: input.max_attempts,
            shard: input.shard,
            origin_queue: None,
            last_error: None,
            scheduled_at: now,
            started_at: None,
            created_at: now,
        };
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn claim(
        &self,
        queue: &str,
        limit: i64,
        slice: Slice,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.queue == queue
                    && j.status == job_status::PENDING
                    && j.scheduled_at <= now
                    && slice.contains(j.shard)
            })
            .map(|(i, _)| i)
            .collect();
        // Stable: equal due times keep insertion order
        due.sort_by_key(|&i| jobs[i].scheduled_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let job = &mut jobs[i];
            job.status = job_status::PROCESSING.to_string();
            job.started_at = Some(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.jobs.lock().await.retain(|j| j.id != id);
        Ok(())
    }

    async fn retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.status = job_status::PENDING.to_string();
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            job.scheduled_at = scheduled_at;
            job.started_at = None;
        }
        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == job_status::PROCESSING)
        {
            job.status = job_status::PENDING.to_string();
            job.started_at = None;
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.origin_queue = Some(std::mem::replace(&mut job.queue, BAD_QUEUE.to_string()));
            job.status = job_status::FAILED.to_string();
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == job_status::FAILED)
        else {
            return Ok(false);
        };
        let Some(origin) = job.origin_queue.take() else {
            return Ok(false);
        };
        job.queue = origin;
        job.status = job_status::PENDING.to_string();
        job.attempts = 0;
        job.started_at = None;
        job.scheduled_at = Utc::now();
        Ok(true)
    }

    async fn recover_stale(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut recovered = 0;
        for job in jobs.iter_mut().filter(|j| {
            j.status == job_status::PROCESSING && j.started_at.is_some_and(|s| s < started_before)
        }) {
            job.status = job_status::PENDING.to_string();
            job.started_at = None;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn list(&self, queue: &str) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut listed: Vec<Job> = jobs.iter().filter(|j| j.queue == queue).cloned().collect();
        listed.sort_by_key(|j| j.scheduled_at);
        Ok(listed)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.iter() {
            if job.queue == queue && job.status == job_status::PENDING {
                stats.pending += 1;
            } else if job.queue == queue && job.status == job_status::PROCESSING {
                stats.processing += 1;
            } else if job.status == job_status::FAILED
                && job.origin_queue.as_deref() == Some(queue)
            {
                stats.failed += 1;
            }
        }
        Ok(stats)
    }
}
