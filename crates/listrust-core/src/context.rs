//! Services shared by chains, workflows and runners

use crate::clock::Clock;
use crate::notify::Notifier;
use crate::pending::Pendings;
use crate::queue::JobQueue;
use crate::requests::Requests;
use chrono::Duration;
use listrust_common::Config;
use listrust_storage::Repositories;
use std::sync::Arc;

#[derive(Clone)]
pub struct Context {
    pub repos: Repositories,
    pub pendings: Pendings,
    pub requests: Requests,
    pub queue: JobQueue,
    pub notifier: Notifier,
    pub clock: Arc<dyn Clock>,
    /// Lifetime of a subscriber confirmation
    pub confirmation_lifetime: Duration,
    /// Lifetime of anything waiting for a moderator
    pub moderation_lifetime: Duration,
}

impl Context {
    pub fn new(repos: Repositories, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let moderation_lifetime = config.pending.moderation_lifetime();
        let pendings = Pendings::new(repos.pendings.clone(), clock.clone());
        let requests = Requests::new(repos.requests.clone(), pendings.clone(), moderation_lifetime);
        let queue = JobQueue::new(repos.jobs.clone(), config.runner.max_attempts);

        Self {
            notifier: Notifier::new(queue.clone()),
            confirmation_lifetime: config.pending.confirmation_lifetime(),
            moderation_lifetime,
            repos,
            pendings,
            requests,
            queue,
            clock,
        }
    }
}
