//! ListRust Core - Mailing list processing
//!
//! Posting chains and pipelines, subscription workflows, the pending store
//! and request ledger they persist into, and the queue runners that drive
//! them.

pub mod chain;
pub mod clock;
pub mod context;
pub mod intake;
pub mod lists;
pub mod maintenance;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod moderator;
pub mod notify;
pub mod pending;
pub mod queue;
pub mod requests;
pub mod runner;
pub mod workflow;

pub use chain::{ChainRegistry, Disposition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use intake::Intake;
pub use lists::ListManager;
pub use maintenance::Maintenance;
pub use message::{Message, MessageData};
pub use metrics::Metrics;
pub use moderator::{Action, Moderator};
pub use notify::{Notification, Notifier};
pub use pending::{Pendable, Pendings};
pub use queue::{JobQueue, WorkItem};
pub use requests::{ListRequests, Requests};
pub use runner::{Dispatch, Dispatcher, Runner};
pub use workflow::{Decision, Flags, Outcome, WorkflowEngine};
