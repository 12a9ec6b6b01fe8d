//! Queue runners
//!
//! A runner owns one slice of one queue. It claims due jobs in batches,
//! hands each to the dispatcher, and settles the job by the outcome:
//! success deletes it, a transient failure reschedules it with backoff until
//! its attempts run out, and anything else moves it to the `bad` queue.
//! Stale and policy failures are final answers, not faults; the job is
//! completed and the outcome logged.
//!
//! Shutdown is cooperative. The current job always runs to the end; jobs
//! claimed but not started go back to the queue.

use crate::chain::ChainRegistry;
use crate::clock::Clock;
use crate::context::Context;
use crate::metrics::Metrics;
use crate::queue::{calculate_backoff, JobQueue, WorkItem, COMMAND, IN, PIPELINE};
use crate::workflow::WorkflowEngine;
use async_trait::async_trait;
use chrono::Duration;
use listrust_common::config::RunnerConfig;
use listrust_common::error::ErrorCategory;
use listrust_common::{Error, Result};
use listrust_storage::{Job, MailingList, Slice};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Processes one work item taken from `queue`
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, queue: &str, item: WorkItem) -> Result<()>;
}

/// Routes items to chains, pipelines and workflows
pub struct Dispatcher {
    ctx: Context,
    registry: Arc<ChainRegistry>,
    engine: WorkflowEngine,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        ctx: Context,
        registry: Arc<ChainRegistry>,
        engine: WorkflowEngine,
        metrics: Metrics,
    ) -> Self {
        Self {
            ctx,
            registry,
            engine,
            metrics,
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
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, queue: &str, item: WorkItem) -> Result<()> {
        match (queue, item) {
            (IN, WorkItem::Message { list_id, mut msg, mut msgdata }) => {
                let list = self.list(&list_id).await?;
                let disposition = self
                    .registry
                    .process(&self.ctx, &list, &mut msg, &mut msgdata)
                    .await?;
                self.metrics.disposition(disposition.as_str());
                Ok(())
            }
            (PIPELINE, WorkItem::Message { list_id, mut msg, mut msgdata }) => {
                let list = self.list(&list_id).await?;
                self.registry
                    .run_pipeline(&self.ctx, &list, &mut msg, &mut msgdata)
                    .await
            }
            (COMMAND, WorkItem::Continuation { token, decision }) => {
                let outcome = self.engine.resume(&token, decision).await?;
                debug!(?outcome, "Continuation processed");
                Ok(())
            }
            (queue, item) => Err(Error::Queue(format!(
                "Queue {} does not take {} items",
                queue,
                item.kind()
            ))),
        }
    }
}

pub struct Runner {
    queue: String,
    slice: Slice,
    jobs: JobQueue,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn Dispatch>,
    config: RunnerConfig,
    metrics: Metrics,
}

impl Runner {
    pub fn new(
        queue: &str,
        slice: Slice,
        ctx: &Context,
        dispatcher: Arc<dyn Dispatch>,
        config: RunnerConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            slice,
            jobs: ctx.queue.clone(),
            clock: ctx.clock.clone(),
            dispatcher,
            config,
            metrics,
        }
    }

    /// Run until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll = std::time::Duration::from_millis(self.config.poll_interval_ms);
        info!(
            queue = %self.queue,
            slice = self.slice.index,
            slices = self.slice.count,
            "Runner started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = match self.run_once(&shutdown).await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(queue = %self.queue, "Error processing queue: {}", e);
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(queue = %self.queue, slice = self.slice.index, "Runner stopped");
    }

    /// Claim one batch and process it. Returns how many jobs ran.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> Result<usize> {
        let jobs = self
            .jobs
            .claim(
                &self.queue,
                self.config.batch_size as i64,
                self.slice,
                self.clock.now(),
            )
            .await?;

        let mut processed = 0;
        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            if *shutdown.borrow() {
                let mut released = 0;
                for unstarted in std::iter::once(job).chain(jobs.by_ref()) {
                    self.jobs.release(unstarted.id).await?;
                    released += 1;
                }
                info!(queue = %self.queue, released, "Released unstarted jobs on shutdown");
                break;
            }
            self.process(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        debug!(queue = %self.queue, job_id = %job_id, attempts = job.attempts, "Processing job");

        let result = match JobQueue::decode(&job) {
            Ok(item) => self.dispatcher.dispatch(&self.queue, item).await,
            Err(e) => Err(e),
        };

        let settled = match result {
            Ok(()) => {
                self.metrics.job(&self.queue, "done");
                self.jobs.complete(job_id).await
            }
            Err(e) => self.settle_failure(&job, e).await,
        };
        if let Err(e) = settled {
            error!(queue = %self.queue, job_id = %job_id, "Failed to settle job: {}", e);
        }
    }

    async fn settle_failure(&self, job: &Job, e: Error) -> Result<()> {
        let message = e.to_string();
        match e.category() {
            ErrorCategory::Stale | ErrorCategory::Policy => {
                warn!(
                    queue = %self.queue,
                    job_id = %job.id,
                    code = e.code(),
                    "Job dropped: {}",
                    message
                );
                self.metrics.job(&self.queue, "dropped");
                self.jobs.complete(job.id).await
            }
            ErrorCategory::Transient => {
                let attempts = job.attempts + 1;
                if attempts >= job.max_attempts {
                    error!(
                        queue = %self.queue,
                        job_id = %job.id,
                        attempts,
                        "Job exceeded max attempts, moving to error queue: {}",
                        message
                    );
                    self.metrics.job(&self.queue, "failed");
                    self.jobs.fail(job.id, &message).await
                } else {
                    let delay = calculate_backoff(
                        attempts - 1,
                        self.config.backoff_base_secs,
                        self.config.backoff_max_secs,
                    );
                    warn!(
                        queue = %self.queue,
                        job_id = %job.id,
                        attempts,
                        retry_in_secs = delay.num_seconds(),
                        "Job failed, will retry: {}",
                        message
                    );
                    self.metrics.job(&self.queue, "retried");
                    self.jobs
                        .retry(job.id, attempts, &message, self.clock.now() + delay)
                        .await
                }
            }
            ErrorCategory::Fatal => {
                error!(
                    queue = %self.queue,
                    job_id = %job.id,
                    code = e.code(),
                    "Job failed permanently, moving to error queue: {}",
                    message
                );
                self.metrics.job(&self.queue, "failed");
                self.jobs.fail(job.id, &message).await
            }
        }
    }
}

/// Slices of a queue, one per runner
pub fn slices(count: u32) -> impl Iterator<Item = Slice> {
    let count = count.max(1);
    (0..count).map(move |index| Slice::new(index, count))
}

/// Time after which a processing job is considered abandoned
pub fn stale_after(config: &RunnerConfig) -> Duration {
    Duration::seconds(config.stale_after_secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::testing::{context, manual_context, test_list};
    use crate::intake::Intake;
    use crate::membership::{add_member, NewMember};
    use crate::message::tests::ANNE_POST;
    use crate::message::MessageData;
    use crate::queue::{BAD, OUT, VIRGIN};
    use crate::workflow::{Decision, Flags};
    use listrust_common::types::{MemberRole, RequestType};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given error a number of times, then succeeds
    struct Flaky {
        failures: usize,
        error: fn() -> Error,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize, error: fn() -> Error) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Dispatch for Flaky {
        async fn dispatch(&self, _queue: &str, _item: WorkItem) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            max_attempts: 3,
            backoff_base_secs: 60,
            ..RunnerConfig::default()
        }
    }

    fn continuation(token: &str) -> WorkItem {
        WorkItem::Continuation {
            token: token.to_string(),
            decision: Decision::Confirm,
        }
    }

    fn runner(ctx: &Context, dispatcher: Arc<dyn Dispatch>, metrics: &Metrics) -> Runner {
        Runner::new(COMMAND, Slice::new(0, 1), ctx, dispatcher, config(), metrics.clone())
    }

    fn idle() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn setup() -> (Context, Arc<ManualClock>, Metrics) {
        let (ctx, clock) = manual_context();
        ctx.queue.enqueue(COMMAND, &continuation("a")).await.unwrap();
        clock.advance(Duration::seconds(1));
        (ctx, clock, Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_success_removes_job() {
        let (ctx, _clock, metrics) = setup().await;
        let flaky = Flaky::new(0, || Error::Database("down".into()));
        let runner = runner(&ctx, flaky.clone(), &metrics);

        assert_eq!(runner.run_once(&idle()).await.unwrap(), 1);
        assert!(ctx.queue.jobs(COMMAND).await.unwrap().is_empty());
        assert_eq!(metrics.job_count(COMMAND, "done"), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_with_backoff_then_fails() {
        let (ctx, clock, metrics) = setup().await;
        let flaky = Flaky::new(10, || Error::Database("down".into()));
        let runner = runner(&ctx, flaky.clone(), &metrics);

        runner.run_once(&idle()).await.unwrap();
        let job = ctx.queue.jobs(COMMAND).await.unwrap().remove(0);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, "pending");
        assert!(job.last_error.unwrap().contains("down"));

        // Not due yet
        assert_eq!(runner.run_once(&idle()).await.unwrap(), 0);

        clock.advance(Duration::seconds(61));
        runner.run_once(&idle()).await.unwrap();
        assert_eq!(ctx.queue.jobs(COMMAND).await.unwrap()[0].attempts, 2);

        clock.advance(Duration::seconds(121));
        runner.run_once(&idle()).await.unwrap();
        assert!(ctx.queue.jobs(COMMAND).await.unwrap().is_empty());

        let bad = ctx.queue.jobs(BAD).await.unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].origin_queue.as_deref(), Some(COMMAND));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.job_count(COMMAND, "retried"), 2);
        assert_eq!(metrics.job_count(COMMAND, "failed"), 1);

        // Operator replay
        assert!(ctx.queue.requeue(bad[0].id).await.unwrap());
        assert_eq!(ctx.queue.stats(COMMAND).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_fatal_failure_goes_straight_to_error_queue() {
        let (ctx, _clock, metrics) = setup().await;
        let flaky = Flaky::new(1, || Error::Queue("garbled".into()));
        let runner = runner(&ctx, flaky.clone(), &metrics);

        runner.run_once(&idle()).await.unwrap();
        assert!(ctx.queue.jobs(COMMAND).await.unwrap().is_empty());
        assert_eq!(ctx.queue.stats(COMMAND).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_stale_item_is_dropped() {
        let (ctx, _clock, metrics) = setup().await;
        let flaky = Flaky::new(1, || Error::UnknownContinuation("a".into()));
        let runner = runner(&ctx, flaky.clone(), &metrics);

        runner.run_once(&idle()).await.unwrap();
        assert!(ctx.queue.jobs(COMMAND).await.unwrap().is_empty());
        assert!(ctx.queue.jobs(BAD).await.unwrap().is_empty());
        assert_eq!(metrics.job_count(COMMAND, "dropped"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_unstarted_jobs() {
        let (ctx, _clock, metrics) = setup().await;
        ctx.queue.enqueue(COMMAND, &continuation("b")).await.unwrap();
        let flaky = Flaky::new(0, || Error::Database("down".into()));
        let runner = runner(&ctx, flaky.clone(), &metrics);

        let (tx, rx) = watch::channel(true);
        assert_eq!(runner.run_once(&rx).await.unwrap(), 0);
        drop(tx);

        let stats = ctx.queue.stats(COMMAND).await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ctx = context();
        let metrics = Metrics::new().unwrap();
        let flaky = Flaky::new(0, || Error::Database("down".into()));
        let runner = runner(&ctx, flaky, &metrics);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));
        ctx.queue.enqueue(COMMAND, &continuation("a")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_slices_share_a_queue() {
        let ctx = context();
        let metrics = Metrics::new().unwrap();
        for i in 0..20 {
            ctx.queue
                .enqueue(COMMAND, &continuation(&format!("token-{}", i)))
                .await
                .unwrap();
        }

        let flaky = Flaky::new(0, || Error::Database("down".into()));
        let mut total = 0;
        for slice in slices(2) {
            let runner = Runner::new(
                COMMAND,
                slice,
                &ctx,
                flaky.clone(),
                RunnerConfig {
                    batch_size: 100,
                    ..config()
                },
                metrics.clone(),
            );
            total += runner.run_once(&idle()).await.unwrap();
        }
        assert_eq!(total, 20);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 20);
    }

    fn dispatcher(ctx: &Context, metrics: &Metrics) -> Arc<dyn Dispatch> {
        Arc::new(Dispatcher::new(
            ctx.clone(),
            Arc::new(ChainRegistry::builtin().unwrap()),
            WorkflowEngine::new(ctx.clone(), metrics.clone()),
            metrics.clone(),
        ))
    }

    async fn drain(ctx: &Context, queue: &str, metrics: &Metrics) {
        let runner = Runner::new(
            queue,
            Slice::new(0, 1),
            ctx,
            dispatcher(ctx, metrics),
            config(),
            metrics.clone(),
        );
        runner.run_once(&idle()).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_flows_from_intake_to_outgoing() {
        let ctx = context();
        let metrics = Metrics::new().unwrap();
        let list = test_list(&ctx).await;
        add_member(&ctx, &list, NewMember::member("anne@example.com")).await.unwrap();
        add_member(&ctx, &list, NewMember::member("bart@example.com")).await.unwrap();

        Intake::new(ctx.queue.clone())
            .inject(&list.list_id, ANNE_POST.as_bytes(), MessageData::default())
            .await
            .unwrap();
        drain(&ctx, IN, &metrics).await;
        drain(&ctx, PIPELINE, &metrics).await;

        match &ctx.queue.items(OUT).await.unwrap()[..] {
            [WorkItem::Message { msg, msgdata, .. }] => {
                assert_eq!(msg.subject.as_deref(), Some("[Test] Hello list"));
                assert_eq!(msgdata.recipients, vec!["anne@example.com", "bart@example.com"]);
            }
            other => panic!("unexpected items {:?}", other),
        }
        assert_eq!(metrics.job_count(IN, "done"), 1);
        assert_eq!(metrics.job_count(PIPELINE, "done"), 1);
    }

    #[tokio::test]
    async fn test_nonmember_post_is_held_by_runner() {
        let ctx = context();
        let metrics = Metrics::new().unwrap();
        let list = test_list(&ctx).await;

        Intake::new(ctx.queue.clone())
            .inject(&list.list_id, ANNE_POST.as_bytes(), MessageData::default())
            .await
            .unwrap();
        drain(&ctx, IN, &metrics).await;

        let ledger = ctx.requests.for_list(&list.list_id);
        assert_eq!(ledger.count_of(RequestType::HeldMessage).await.unwrap(), 1);
        assert!(ctx.queue.items(PIPELINE).await.unwrap().is_empty());
        assert_eq!(ctx.notifier.pending().await.unwrap().len(), 2);
        assert_eq!(ctx.queue.stats(VIRGIN).await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_confirmation_arrives_as_command() {
        let ctx = context();
        let metrics = Metrics::new().unwrap();
        test_list(&ctx).await;
        let engine = WorkflowEngine::new(ctx.clone(), metrics.clone());

        let outcome = engine
            .subscribe("test@example.com", "anne@example.com", None, Flags::new(true, false, false))
            .await
            .unwrap();
        let intake = Intake::new(ctx.queue.clone());
        let token = outcome.token().unwrap();
        intake.continuation(token, Decision::Confirm).await.unwrap();
        intake.continuation(token, Decision::Confirm).await.unwrap();

        drain(&ctx, COMMAND, &metrics).await;

        assert!(ctx
            .repos
            .members
            .get("test@example.com", "anne@example.com", MemberRole::Member)
            .await
            .unwrap()
            .is_some());
        // The duplicate reply is stale, not a fault
        assert_eq!(metrics.job_count(COMMAND, "done"), 1);
        assert_eq!(metrics.job_count(COMMAND, "dropped"), 1);
        assert!(ctx.queue.jobs(BAD).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_item_on_wrong_queue_is_bad() {
        let ctx = context();
        let metrics = Metrics::new().unwrap();
        ctx.queue.enqueue(IN, &continuation("a")).await.unwrap();
        drain(&ctx, IN, &metrics).await;
        assert_eq!(ctx.queue.stats(IN).await.unwrap().failed, 1);
    }
}
