//! Periodic housekeeping: expired pendings, dead workflow claims, and jobs
//! orphaned by a crashed runner

use crate::context::Context;
use chrono::Duration;
use listrust_common::Result;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub evicted: u64,
    pub workflows: u64,
    pub recovered: u64,
}

pub struct Maintenance {
    ctx: Context,
    stale_after: Duration,
}

impl Maintenance {
    pub fn new(ctx: Context, stale_after: Duration) -> Self {
        Self { ctx, stale_after }
    }

    pub async fn run_once(&self) -> Result<Report> {
        let now = self.ctx.clock.now();
        let report = Report {
            evicted: self.ctx.pendings.evict_expired().await?,
            workflows: self.ctx.repos.workflows.delete_expired(now).await?,
            recovered: self.ctx.queue.recover_stale(now - self.stale_after).await?,
        };
        if report != Report::default() {
            info!(
                evicted = report.evicted,
                workflows = report.workflows,
                recovered = report.recovered,
                "Maintenance pass"
            );
        }
        Ok(report)
    }

    pub async fn run(self, every: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        info!(interval_secs = every.as_secs(), "Maintenance task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Maintenance pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Maintenance task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::context::testing::manual_context;
    use crate::pending::Pendable;
    use crate::queue::{WorkItem, COMMAND};
    use crate::workflow::Decision;
    use listrust_storage::{Slice, WorkflowKey};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_run_once_cleans_up() {
        let (ctx, clock) = manual_context();
        let maintenance = Maintenance::new(ctx.clone(), Duration::minutes(10));

        ctx.pendings
            .add(Pendable::with_type("test"), Duration::hours(1))
            .await
            .unwrap();
        let key = WorkflowKey::new("test@example.com", "anne@example.com", "subscription");
        let now = clock.now();
        ctx.repos
            .workflows
            .claim(&key, "t", now + Duration::hours(1), now)
            .await
            .unwrap();
        let item = WorkItem::Continuation {
            token: "t".to_string(),
            decision: Decision::Confirm,
        };
        ctx.queue.enqueue(COMMAND, &item).await.unwrap();
        clock.advance(Duration::seconds(1));
        let claimed = ctx
            .queue
            .claim(COMMAND, 10, Slice::new(0, 1), clock.now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        assert_eq!(maintenance.run_once().await.unwrap(), Report::default());

        clock.advance(Duration::hours(2));
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(
            report,
            Report {
                evicted: 1,
                workflows: 1,
                recovered: 1,
            }
        );
        assert_eq!(ctx.queue.stats(COMMAND).await.unwrap().pending, 1);
    }
}
