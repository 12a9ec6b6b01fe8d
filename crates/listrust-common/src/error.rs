//! Error types for ListRust

use thiserror::Error;

/// Main error type for ListRust
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Mailing list already exists: {0}")]
    ListAlreadyExists(String),

    #[error("{email} is already subscribed to {list_id}")]
    AlreadySubscribed { list_id: String, email: String },

    #[error("{email} is not a member of {list_id}")]
    NotAMember { list_id: String, email: String },

    #[error("{email} is banned from {list_id}")]
    MembershipBanned { list_id: String, email: String },

    #[error("A {kind} workflow is already pending for {email} on {list_id}")]
    WorkflowPending {
        list_id: String,
        email: String,
        kind: String,
    },

    #[error("Unknown or expired continuation token: {0}")]
    UnknownContinuation(String),

    #[error("Decision {decision} does not apply at step {step}")]
    InvalidDecision { decision: String, step: String },

    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ListRust
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by whoever observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expired token, already-resolved request, already-completed step.
    Stale,
    /// The request would violate list or membership policy; nothing was created.
    Policy,
    /// Worth retrying: storage timeouts and unexpected handler failures.
    Transient,
    /// Misconfiguration or a payload that can never succeed.
    Fatal,
}

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::InvalidEmail(_) => "INVALID_EMAIL",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::ListAlreadyExists(_) => "LIST_EXISTS",
            Error::AlreadySubscribed { .. } => "ALREADY_SUBSCRIBED",
            Error::NotAMember { .. } => "NOT_A_MEMBER",
            Error::MembershipBanned { .. } => "BANNED",
            Error::WorkflowPending { .. } => "WORKFLOW_PENDING",
            Error::UnknownContinuation(_) => "UNKNOWN_CONTINUATION",
            Error::InvalidDecision { .. } => "INVALID_DECISION",
            Error::UnknownRule(_) => "UNKNOWN_RULE",
            Error::UnknownHandler(_) => "UNKNOWN_HANDLER",
            Error::UnknownChain(_) => "UNKNOWN_CHAIN",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the failure category used for retry and reporting decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnknownContinuation(_) | Error::NotFound(_) => ErrorCategory::Stale,
            Error::InvalidEmail(_)
            | Error::Validation(_)
            | Error::ListAlreadyExists(_)
            | Error::AlreadySubscribed { .. }
            | Error::NotAMember { .. }
            | Error::MembershipBanned { .. }
            | Error::WorkflowPending { .. }
            | Error::InvalidDecision { .. } => ErrorCategory::Policy,
            Error::Database(_)
            | Error::Storage(_)
            | Error::Internal(_)
            | Error::Other(_) => ErrorCategory::Transient,
            Error::Config(_)
            | Error::UnknownRule(_)
            | Error::UnknownHandler(_)
            | Error::UnknownChain(_)
            | Error::Queue(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether a runner should retry the work item that produced this error
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}
