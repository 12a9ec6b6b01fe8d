//! Subscription workflows
//!
//! A workflow walks one address on one list through a fixed sequence of
//! steps. A step that needs an answer from outside suspends the workflow:
//! its state is pended under a fresh token, the token is handed out, and
//! nothing runs until someone resumes with that token. Resuming takes the
//! pended state, so of any number of concurrent resumers only one proceeds.
//!
//! Join: verify address, confirm, moderator approval, subscribe.
//! Leave: confirm, moderator approval, unsubscribe.
//!
//! Each (list, address, kind) has at most one live workflow, enforced by an
//! atomic claim in the workflow index that follows the current token.

use crate::context::Context;
use crate::membership::{self, canonical_email, NewMember};
use crate::metrics::Metrics;
use crate::notify::{templates, Notification};
use crate::pending::{generate_token, Pendable};
use listrust_common::types::{MemberRole, RequestId, RequestType, Token};
use listrust_common::{Error, Result};
use listrust_storage::{CreateAddress, MailingList, WorkflowKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Type label of a pended workflow state
pub const WORKFLOW_TYPE: &str = "workflow";
const STATE_KEY: &str = "state";

/// Keys of the data held with a subscription request
pub mod held {
    pub const TOKEN: &str = "token";
    pub const EMAIL: &str = "email";
    pub const DISPLAY_NAME: &str = "display_name";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Subscription,
    Unsubscription,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Subscription => "subscription",
            WorkflowKind::Unsubscription => "unsubscription",
        }
    }

    fn first_step(&self) -> Step {
        match self {
            WorkflowKind::Subscription => Step::VerifyAddress,
            WorkflowKind::Unsubscription => Step::Confirm,
        }
    }

    fn final_step(&self) -> Step {
        match self {
            WorkflowKind::Subscription => Step::Subscribe,
            WorkflowKind::Unsubscription => Step::Unsubscribe,
        }
    }

    fn request_type(&self) -> RequestType {
        match self {
            WorkflowKind::Subscription => RequestType::Subscription,
            WorkflowKind::Unsubscription => RequestType::Unsubscription,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    VerifyAddress,
    Confirm,
    ModeratorApproval,
    Subscribe,
    Unsubscribe,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::VerifyAddress => "verify_address",
            Step::Confirm => "confirm",
            Step::ModeratorApproval => "moderator_approval",
            Step::Subscribe => "subscribe",
            Step::Unsubscribe => "unsubscribe",
        }
    }
}

/// The answer a suspended workflow is resumed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The subject confirmed
    Confirm,
    /// A moderator approved
    Approve,
    /// A moderator refused; the subject is told why
    Reject { reason: Option<String> },
    /// Drop the workflow silently
    Discard,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Confirm => "confirm",
            Decision::Approve => "approve",
            Decision::Reject { .. } => "reject",
            Decision::Discard => "discard",
        }
    }
}

/// Trust decisions made by the caller. A set flag skips its step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub pre_verified: bool,
    #[serde(default)]
    pub pre_confirmed: bool,
    #[serde(default)]
    pub pre_approved: bool,
}

impl Flags {
    pub fn new(pre_verified: bool, pre_confirmed: bool, pre_approved: bool) -> Self {
        Self {
            pre_verified,
            pre_confirmed,
            pre_approved,
        }
    }

    pub fn all() -> Self {
        Self::new(true, true, true)
    }
}

/// Everything needed to run a workflow on from its current step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub kind: WorkflowKind,
    pub list_id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub step: Step,
    pub flags: Flags,
    /// The address is unverified; the confirmation verifies it
    #[serde(default)]
    pub verify_on_confirm: bool,
    #[serde(default)]
    pub held_request_id: Option<RequestId>,
}

impl WorkflowState {
    fn key(&self) -> WorkflowKey {
        WorkflowKey::new(&self.list_id, &self.email, self.kind.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Confirmation,
    Approval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Suspended { token: Token, awaiting: Awaiting },
    Abandoned,
}

impl Outcome {
    pub fn token(&self) -> Option<&str> {
        match self {
            Outcome::Suspended { token, .. } => Some(token),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    ctx: Context,
    metrics: Metrics,
}

impl WorkflowEngine {
    pub fn new(ctx: Context, metrics: Metrics) -> Self {
        Self { ctx, metrics }
    }

    /// Start a join workflow
    pub async fn subscribe(
        &self,
        list_id: &str,
        email: &str,
        display_name: Option<String>,
        flags: Flags,
    ) -> Result<Outcome> {
        self.start(WorkflowKind::Subscription, list_id, email, display_name, flags)
            .await
    }

    /// Start a leave workflow
    pub async fn unsubscribe(&self, list_id: &str, email: &str, flags: Flags) -> Result<Outcome> {
        self.start(WorkflowKind::Unsubscription, list_id, email, None, flags)
            .await
    }

    pub async fn start(
        &self,
        kind: WorkflowKind,
        list_id: &str,
        email: &str,
        display_name: Option<String>,
        flags: Flags,
    ) -> Result<Outcome> {
        let list = self.list(list_id).await?;
        let email = canonical_email(email)?;
        self.check_subject(kind, &list, &email).await?;

        let state = WorkflowState {
            kind,
            list_id: list.list_id.clone(),
            email,
            display_name,
            step: kind.first_step(),
            flags,
            verify_on_confirm: false,
            held_request_id: None,
        };

        let token = generate_token();
        let now = self.ctx.clock.now();
        let claimed = self
            .ctx
            .repos
            .workflows
            .claim(&state.key(), &token, now + self.ctx.confirmation_lifetime, now)
            .await?;
        if !claimed {
            return Err(Error::WorkflowPending {
                list_id: state.list_id,
                email: state.email,
                kind: kind.as_str().to_string(),
            });
        }

        self.metrics.workflow_event(kind.as_str(), "started");
        info!(
            list_id = %state.list_id,
            email = %state.email,
            kind = kind.as_str(),
            ?flags,
            "Workflow started"
        );

        let key = state.key();
        match self.run(&list, state, &token).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.release(&key, &token).await;
                Err(e)
            }
        }
    }

    /// Resume a suspended workflow
    ///
    /// A missing or expired token fails with `UnknownContinuation`. The
    /// decision is checked against the suspended step before the state is
    /// taken, so a wrong decision leaves the workflow waiting.
    pub async fn resume(&self, token: &str, decision: Decision) -> Result<Outcome> {
        let pended = self
            .ctx
            .pendings
            .peek(token)
            .await?
            .ok_or_else(|| Error::UnknownContinuation(token.to_string()))?;
        let state = state_of(&pended, token)?;
        check_decision(&state, &decision)?;
        let list = self.list(&state.list_id).await?;

        let Some((pended, expires_at)) = self.ctx.pendings.take(token).await? else {
            debug!(token = %token, "Workflow resumed concurrently");
            return Err(Error::UnknownContinuation(token.to_string()));
        };
        let state = state_of(&pended, token)?;
        let key = state.key();

        info!(
            list_id = %state.list_id,
            email = %state.email,
            step = state.step.as_str(),
            decision = decision.as_str(),
            "Workflow resumed"
        );

        match self.apply(&list, state, token, decision).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_transient() => {
                // Restore the suspension, expiring when it always would have
                if !self.ctx.pendings.put_until(token, pended, expires_at).await? {
                    warn!(token = %token, "Could not restore suspended workflow");
                }
                Err(e)
            }
            Err(e) => {
                self.release(&key, token).await;
                self.metrics.workflow_event(key.kind.as_str(), "failed");
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        list: &MailingList,
        mut state: WorkflowState,
        token: &str,
        decision: Decision,
    ) -> Result<Outcome> {
        match (state.step, decision) {
            (Step::Confirm, Decision::Confirm) => {
                if state.verify_on_confirm {
                    self.ctx
                        .repos
                        .addresses
                        .set_verified(&state.email, self.ctx.clock.now())
                        .await?;
                    state.verify_on_confirm = false;
                }
                state.flags.pre_confirmed = true;
                state.step = Step::ModeratorApproval;
                self.run(list, state, token).await
            }
            (Step::ModeratorApproval, Decision::Approve) => {
                self.resolve_held(&state).await?;
                state.flags.pre_approved = true;
                state.step = state.kind.final_step();
                self.run(list, state, token).await
            }
            (_, Decision::Reject { reason }) => {
                self.resolve_held(&state).await?;
                let reason = reason.unwrap_or_else(|| "[No reason given]".to_string());
                self.ctx
                    .notifier
                    .send(
                        Notification::new(&list.list_id, &state.email, templates::SUBSCRIPTION_DENIED)
                            .with("kind", state.kind.as_str())
                            .with("reason", reason.as_str()),
                    )
                    .await?;
                self.abandon(&state, token).await
            }
            (_, Decision::Discard) => {
                self.resolve_held(&state).await?;
                self.abandon(&state, token).await
            }
            (step, decision) => Err(Error::InvalidDecision {
                decision: decision.as_str().to_string(),
                step: step.as_str().to_string(),
            }),
        }
    }

    /// Run forward from `state.step` until done or suspended
    async fn run(&self, list: &MailingList, mut state: WorkflowState, token: &str) -> Result<Outcome> {
        loop {
            debug!(email = %state.email, step = state.step.as_str(), "Workflow step");
            match state.step {
                Step::VerifyAddress => {
                    self.verify_address(&mut state).await?;
                    state.step = Step::Confirm;
                }
                Step::Confirm => {
                    if state.flags.pre_confirmed && !state.verify_on_confirm {
                        state.step = Step::ModeratorApproval;
                    } else {
                        return self.suspend(list, state, token, Awaiting::Confirmation).await;
                    }
                }
                Step::ModeratorApproval => {
                    let policy = match state.kind {
                        WorkflowKind::Subscription => list.subscription_policy_enum(),
                        WorkflowKind::Unsubscription => list.unsubscription_policy_enum(),
                    };
                    if state.flags.pre_approved || !policy.requires_approval() {
                        state.step = state.kind.final_step();
                    } else {
                        return self.suspend(list, state, token, Awaiting::Approval).await;
                    }
                }
                Step::Subscribe => {
                    let new = NewMember::member(&state.email)
                        .with_display_name(state.display_name.clone());
                    match membership::add_member(&self.ctx, list, new).await {
                        Ok(_) => {}
                        // A retry after the member row was written
                        Err(Error::AlreadySubscribed { .. }) => {
                            debug!(email = %state.email, "Subject already subscribed");
                        }
                        Err(e) => return Err(e),
                    }
                    return self.complete(&state, token).await;
                }
                Step::Unsubscribe => {
                    match membership::delete_member(&self.ctx, list, &state.email).await {
                        Ok(()) => {}
                        Err(Error::NotAMember { .. }) => {
                            debug!(email = %state.email, "Subject already unsubscribed");
                        }
                        Err(e) => return Err(e),
                    }
                    return self.complete(&state, token).await;
                }
            }
        }
    }

    async fn verify_address(&self, state: &mut WorkflowState) -> Result<()> {
        let address = self
            .ctx
            .repos
            .addresses
            .get_or_create(CreateAddress {
                email: state.email.clone(),
                original_email: state.email.clone(),
                display_name: state.display_name.clone(),
            })
            .await?;

        if address.verified_on.is_some() {
            return Ok(());
        }
        if state.flags.pre_verified {
            self.ctx
                .repos
                .addresses
                .set_verified(&state.email, self.ctx.clock.now())
                .await?;
        } else {
            state.verify_on_confirm = true;
        }
        Ok(())
    }

    /// Pend the state under a new token, tell whoever has to answer, and
    /// move the claim to the new token
    ///
    /// On failure nothing written here survives and the claim still follows
    /// `old_token`.
    async fn suspend(
        &self,
        list: &MailingList,
        mut state: WorkflowState,
        old_token: &str,
        awaiting: Awaiting,
    ) -> Result<Outcome> {
        let token = generate_token();
        if let Err(e) = self.park(list, &mut state, old_token, &token, awaiting).await {
            self.unpark(&state, &token).await;
            return Err(e);
        }

        self.metrics.workflow_event(state.kind.as_str(), "suspended");
        info!(
            list_id = %state.list_id,
            email = %state.email,
            step = state.step.as_str(),
            ?awaiting,
            "Workflow suspended"
        );
        Ok(Outcome::Suspended { token, awaiting })
    }

    async fn park(
        &self,
        list: &MailingList,
        state: &mut WorkflowState,
        old_token: &str,
        token: &str,
        awaiting: Awaiting,
    ) -> Result<()> {
        let lifetime = match awaiting {
            Awaiting::Confirmation => self.ctx.confirmation_lifetime,
            Awaiting::Approval => self.ctx.moderation_lifetime,
        };

        if awaiting == Awaiting::Approval {
            let mut data = Pendable::with_type(state.kind.as_str());
            data.insert_str(held::TOKEN, token);
            data.insert_str(held::EMAIL, state.email.as_str());
            if let Some(name) = &state.display_name {
                data.insert_str(held::DISPLAY_NAME, name.as_str());
            }
            let request_id = self
                .ctx
                .requests
                .for_list(&state.list_id)
                .hold(state.kind.request_type(), &state.email, Some(data))
                .await?;
            state.held_request_id = Some(request_id);
        }

        let mut pendable = Pendable::with_type(WORKFLOW_TYPE);
        pendable.insert(STATE_KEY, &*state)?;
        if !self.ctx.pendings.put(token, pendable, lifetime).await? {
            return Err(Error::Internal("Workflow token collision".to_string()));
        }

        let notification = match (awaiting, state.kind) {
            (Awaiting::Confirmation, kind) => {
                let template = match kind {
                    WorkflowKind::Subscription => templates::CONFIRM_SUBSCRIBE,
                    WorkflowKind::Unsubscription => templates::CONFIRM_UNSUBSCRIBE,
                };
                Notification::new(&list.list_id, &state.email, template)
                    .with("token", token)
                    .with("confirm_address", list.confirm_address(token))
            }
            (Awaiting::Approval, kind) => {
                let template = match kind {
                    WorkflowKind::Subscription => templates::SUBSCRIPTION_HELD,
                    WorkflowKind::Unsubscription => templates::UNSUBSCRIPTION_HELD,
                };
                Notification::new(&list.list_id, &list.owner_address(), template)
                    .with("member", state.email.as_str())
                    .with(
                        "request_id",
                        state.held_request_id.map(|id| id.to_string()).unwrap_or_default(),
                    )
            }
        };
        self.ctx.notifier.send(notification).await?;

        let now = self.ctx.clock.now();
        let moved = self
            .ctx
            .repos
            .workflows
            .reassign(&state.key(), old_token, token, now + lifetime)
            .await?;
        if !moved {
            warn!(email = %state.email, list_id = %state.list_id, "Workflow claim lost while suspending");
        }
        Ok(())
    }

    /// Drop what a failed [`WorkflowEngine::park`] wrote
    async fn unpark(&self, state: &WorkflowState, token: &str) {
        if let Err(e) = self.ctx.pendings.confirm(token, true).await {
            warn!(error = %e, email = %state.email, "Failed to drop pended workflow state");
        }
        if let Err(e) = self.resolve_held(state).await {
            warn!(error = %e, email = %state.email, "Failed to drop held workflow request");
        }
        debug!(email = %state.email, list_id = %state.list_id, "Suspension rolled back");
    }

    async fn complete(&self, state: &WorkflowState, token: &str) -> Result<Outcome> {
        self.release(&state.key(), token).await;
        self.metrics.workflow_event(state.kind.as_str(), "completed");
        info!(list_id = %state.list_id, email = %state.email, kind = state.kind.as_str(), "Workflow completed");
        Ok(Outcome::Completed)
    }

    async fn abandon(&self, state: &WorkflowState, token: &str) -> Result<Outcome> {
        self.release(&state.key(), token).await;
        self.metrics.workflow_event(state.kind.as_str(), "abandoned");
        info!(list_id = %state.list_id, email = %state.email, kind = state.kind.as_str(), "Workflow abandoned");
        Ok(Outcome::Abandoned)
    }

    async fn resolve_held(&self, state: &WorkflowState) -> Result<()> {
        if let Some(id) = state.held_request_id {
            self.ctx.requests.for_list(&state.list_id).resolve(id).await?;
        }
        Ok(())
    }

    async fn release(&self, key: &WorkflowKey, token: &str) {
        if let Err(e) = self.ctx.repos.workflows.release(key, token).await {
            warn!(error = %e, email = %key.email, "Failed to release workflow claim");
        }
    }

    async fn list(&self, list_id: &str) -> Result<MailingList> {
        self.ctx
            .repos
            .lists
            .get(list_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Mailing list {}", list_id)))
    }

    /// Refuse workflows that could never complete
    async fn check_subject(&self, kind: WorkflowKind, list: &MailingList, email: &str) -> Result<()> {
        let member = self
            .ctx
            .repos
            .members
            .get(&list.list_id, email, MemberRole::Member)
            .await?;
        match (kind, member) {
            (WorkflowKind::Subscription, Some(_)) => Err(Error::AlreadySubscribed {
                list_id: list.list_id.clone(),
                email: email.to_string(),
            }),
            (WorkflowKind::Subscription, None) => {
                if crate::chain::rules::is_banned(&list.ban_patterns_vec(), email) {
                    Err(Error::MembershipBanned {
                        list_id: list.list_id.clone(),
                        email: email.to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            (WorkflowKind::Unsubscription, None) => Err(Error::NotAMember {
                list_id: list.list_id.clone(),
                email: email.to_string(),
            }),
            (WorkflowKind::Unsubscription, Some(_)) => Ok(()),
        }
    }

}

fn state_of(pended: &Pendable, token: &str) -> Result<WorkflowState> {
    if pended.type_label() != Some(WORKFLOW_TYPE) {
        return Err(Error::UnknownContinuation(token.to_string()));
    }
    pended
        .get::<WorkflowState>(STATE_KEY)?
        .ok_or_else(|| Error::Storage(format!("Workflow {} has no state", token)))
}

fn check_decision(state: &WorkflowState, decision: &Decision) -> Result<()> {
    let allowed = match state.step {
        Step::Confirm => matches!(decision, Decision::Confirm | Decision::Discard),
        Step::ModeratorApproval => matches!(
            decision,
            Decision::Approve | Decision::Reject { .. } | Decision::Discard
        ),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::InvalidDecision {
            decision: decision.as_str().to_string(),
            step: state.step.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{context, failing_context, manual_context, test_list};
    use crate::queue::VIRGIN;
    use chrono::Duration;
    use listrust_common::types::SubscriptionPolicy;
    use listrust_storage::ListSettings;
    use pretty_assertions::assert_eq;

    fn engine(ctx: &Context) -> WorkflowEngine {
        WorkflowEngine::new(ctx.clone(), Metrics::new().unwrap())
    }

    async fn moderated_list(ctx: &Context) -> MailingList {
        let mut settings = ListSettings::with_display_name("Test");
        settings.subscription_policy = SubscriptionPolicy::Moderate;
        settings.unsubscription_policy = SubscriptionPolicy::Moderate;
        ctx.repos.lists.create("test@example.com", settings).await.unwrap()
    }

    async fn is_member(ctx: &Context, email: &str) -> bool {
        ctx.repos
            .members
            .get("test@example.com", email, MemberRole::Member)
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn test_preverified_address_confirms_then_joins() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = match &outcome {
            Outcome::Suspended {
                token,
                awaiting: Awaiting::Confirmation,
            } => token.clone(),
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(!is_member(&ctx, "anne@example.com").await);

        let notices = ctx.notifier.pending().await.unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].template, templates::CONFIRM_SUBSCRIBE);
        assert_eq!(notices[0].substitutions["token"], token);

        let outcome = engine.resume(&token, Decision::Confirm).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert!(is_member(&ctx, "anne@example.com").await);
        let anne = ctx.repos.addresses.get("anne@example.com").await.unwrap().unwrap();
        assert!(anne.verified_on.is_some());
        assert_eq!(ctx.pendings.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_all_flags_complete_synchronously() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::all())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert!(is_member(&ctx, "anne@example.com").await);
        assert_eq!(ctx.requests.for_list("test@example.com").count().await.unwrap(), 0);
        assert_eq!(ctx.pendings.count().await.unwrap(), 0);
        assert_eq!(engine.metrics.workflow_event_count("subscription", "suspended"), 0);
    }

    #[tokio::test]
    async fn test_unverified_address_needs_confirmation_even_if_preconfirmed() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(false, true, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();
        let anne = ctx.repos.addresses.get("anne@example.com").await.unwrap().unwrap();
        assert!(anne.verified_on.is_none());

        engine.resume(&token, Decision::Confirm).await.unwrap();
        let anne = ctx.repos.addresses.get("anne@example.com").await.unwrap().unwrap();
        assert!(anne.verified_on.is_some());
    }

    #[tokio::test]
    async fn test_second_start_for_pending_subject_fails() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::default())
            .await
            .unwrap();
        let second = engine
            .subscribe("test@example.com", "Anne@example.com", None, Flags::default())
            .await;
        assert!(matches!(second, Err(Error::WorkflowPending { .. })));
        assert_eq!(ctx.pendings.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resume_twice_subscribes_once() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        engine.resume(&token, Decision::Confirm).await.unwrap();
        assert!(matches!(
            engine.resume(&token, Decision::Confirm).await,
            Err(Error::UnknownContinuation(_))
        ));
        let members = ctx
            .repos
            .members
            .list("test@example.com", Some(MemberRole::Member))
            .await
            .unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resume_runs_once() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let token = token.clone();
                tokio::spawn(async move { engine.resume(&token, Decision::Confirm).await })
            })
            .collect();

        let mut completed = 0;
        let mut unknown = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Outcome::Completed) => completed += 1,
                Err(Error::UnknownContinuation(_)) => unknown += 1,
                other => panic!("unexpected result {:?}", other),
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(unknown, 7);
        assert_eq!(engine.metrics.workflow_event_count("subscription", "completed"), 1);
    }

    #[tokio::test]
    async fn test_moderated_join_is_held_then_approved() {
        let ctx = context();
        moderated_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe(
                "test@example.com",
                "anne@example.com",
                Some("Anne Person".to_string()),
                Flags::new(true, true, false),
            )
            .await
            .unwrap();
        let token = match &outcome {
            Outcome::Suspended {
                token,
                awaiting: Awaiting::Approval,
            } => token.clone(),
            other => panic!("unexpected outcome {:?}", other),
        };

        let ledger = ctx.requests.for_list("test@example.com");
        let held = ledger.of_type(RequestType::Subscription).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].key, "anne@example.com");
        let entry = ledger
            .get(held[0].id, Some(RequestType::Subscription))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.data.unwrap().get_str(held::TOKEN), Some(token.as_str()));

        let notices = ctx.notifier.pending().await.unwrap();
        assert_eq!(notices[0].template, templates::SUBSCRIPTION_HELD);
        assert_eq!(notices[0].recipient, "test-owner@example.com");

        let outcome = engine.resume(&token, Decision::Approve).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert!(is_member(&ctx, "anne@example.com").await);
        assert_eq!(ledger.count().await.unwrap(), 0);
        let member = ctx
            .repos
            .members
            .get("test@example.com", "anne@example.com", MemberRole::Member)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.display_name.as_deref(), Some("Anne Person"));
    }

    #[tokio::test]
    async fn test_rejected_join_notifies_and_frees_subject() {
        let ctx = context();
        moderated_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, true, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        let outcome = engine
            .resume(
                &token,
                Decision::Reject {
                    reason: Some("Invitation only".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Abandoned);
        assert!(!is_member(&ctx, "anne@example.com").await);
        assert_eq!(ctx.requests.for_list("test@example.com").count().await.unwrap(), 0);

        let denied = ctx.notifier.pending().await.unwrap().pop().unwrap();
        assert_eq!(denied.template, templates::SUBSCRIPTION_DENIED);
        assert_eq!(denied.substitutions["reason"], "Invitation only");

        // The subject may try again
        assert!(engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, true, false))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_wrong_decision_leaves_workflow_waiting() {
        let ctx = context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        assert!(matches!(
            engine.resume(&token, Decision::Approve).await,
            Err(Error::InvalidDecision { .. })
        ));
        assert!(ctx.pendings.peek(&token).await.unwrap().is_some());
        assert_eq!(engine.resume(&token, Decision::Confirm).await.unwrap(), Outcome::Completed);
    }

    #[tokio::test]
    async fn test_expired_workflow_is_unknown_and_restartable() {
        let (ctx, clock) = manual_context();
        test_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        clock.advance(Duration::days(4));
        assert!(matches!(
            engine.resume(&token, Decision::Confirm).await,
            Err(Error::UnknownContinuation(_))
        ));
        assert!(!is_member(&ctx, "anne@example.com").await);

        let again = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        assert!(matches!(again, Outcome::Suspended { .. }));
    }

    #[tokio::test]
    async fn test_failed_confirmation_notice_frees_subject() {
        let (ctx, _clock) = failing_context(VIRGIN, 0, 1);
        test_list(&ctx).await;
        let engine = engine(&ctx);

        assert!(matches!(
            engine
                .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
                .await,
            Err(Error::Database(_))
        ));
        assert_eq!(ctx.pendings.count().await.unwrap(), 0);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Suspended {
                awaiting: Awaiting::Confirmation,
                ..
            }
        ));
        assert_eq!(ctx.notifier.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_hold_notice_leaves_confirmation_resumable() {
        let (ctx, _clock) = failing_context(VIRGIN, 1, 1);
        moderated_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        assert!(matches!(
            engine.resume(&token, Decision::Confirm).await,
            Err(Error::Database(_))
        ));
        let ledger = ctx.requests.for_list("test@example.com");
        assert_eq!(ledger.count().await.unwrap(), 0);
        assert!(ctx.pendings.peek(&token).await.unwrap().is_some());

        let outcome = engine.resume(&token, Decision::Confirm).await.unwrap();
        let approval = match &outcome {
            Outcome::Suspended {
                token,
                awaiting: Awaiting::Approval,
            } => token.clone(),
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(ledger.count_of(RequestType::Subscription).await.unwrap(), 1);
        assert!(matches!(
            engine
                .subscribe("test@example.com", "anne@example.com", None, Flags::all())
                .await,
            Err(Error::WorkflowPending { .. })
        ));

        assert_eq!(engine.resume(&approval, Decision::Approve).await.unwrap(), Outcome::Completed);
        assert!(is_member(&ctx, "anne@example.com").await);
    }

    #[tokio::test]
    async fn test_restored_confirmation_keeps_its_expiry() {
        let (ctx, clock) = failing_context(VIRGIN, 1, 1);
        moderated_list(&ctx).await;
        let engine = engine(&ctx);

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();

        clock.advance(Duration::days(2));
        assert!(engine.resume(&token, Decision::Confirm).await.is_err());

        clock.advance(Duration::days(1) + Duration::minutes(1));
        assert!(matches!(
            engine.resume(&token, Decision::Confirm).await,
            Err(Error::UnknownContinuation(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_workflow() {
        let ctx = context();
        let list = test_list(&ctx).await;
        membership::add_member(&ctx, &list, NewMember::member("anne@example.com"))
            .await
            .unwrap();
        let engine = engine(&ctx);

        let outcome = engine
            .unsubscribe("test@example.com", "anne@example.com", Flags::default())
            .await
            .unwrap();
        let token = outcome.token().unwrap().to_string();
        assert!(is_member(&ctx, "anne@example.com").await);

        assert_eq!(engine.resume(&token, Decision::Confirm).await.unwrap(), Outcome::Completed);
        assert!(!is_member(&ctx, "anne@example.com").await);

        let sent: Vec<String> = ctx
            .notifier
            .pending()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.template)
            .collect();
        assert_eq!(
            sent,
            vec![templates::WELCOME, templates::CONFIRM_UNSUBSCRIBE, templates::GOODBYE]
        );
    }

    #[tokio::test]
    async fn test_moderated_leave_is_held() {
        let ctx = context();
        let list = moderated_list(&ctx).await;
        membership::add_member(&ctx, &list, NewMember::member("anne@example.com"))
            .await
            .unwrap();
        let engine = engine(&ctx);

        let outcome = engine
            .unsubscribe("test@example.com", "anne@example.com", Flags::new(false, true, false))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Suspended {
                awaiting: Awaiting::Approval,
                ..
            }
        ));
        let ledger = ctx.requests.for_list("test@example.com");
        assert_eq!(ledger.count_of(RequestType::Unsubscription).await.unwrap(), 1);

        engine
            .resume(outcome.token().unwrap(), Decision::Approve)
            .await
            .unwrap();
        assert!(!is_member(&ctx, "anne@example.com").await);
    }

    #[tokio::test]
    async fn test_sanity_checks_come_first() {
        let ctx = context();
        let list = test_list(&ctx).await;
        membership::add_member(&ctx, &list, NewMember::member("anne@example.com"))
            .await
            .unwrap();
        let engine = engine(&ctx);

        assert!(matches!(
            engine
                .subscribe("test@example.com", "anne@example.com", None, Flags::all())
                .await,
            Err(Error::AlreadySubscribed { .. })
        ));
        assert!(matches!(
            engine
                .unsubscribe("test@example.com", "bart@example.com", Flags::all())
                .await,
            Err(Error::NotAMember { .. })
        ));
        assert!(matches!(
            engine
                .subscribe("missing@example.com", "bart@example.com", None, Flags::all())
                .await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            engine.resume("no-such-token", Decision::Confirm).await,
            Err(Error::UnknownContinuation(_))
        ));
    }
}
