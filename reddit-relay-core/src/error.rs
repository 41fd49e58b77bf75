//! Failure taxonomy for the relay core.
//!
//! # Error Handling
//! Each concern owns one enum. Cycle-level failures ([`FetchError`], [`DedupUnavailable`])
//! abort only the current cycle of one rule. Pipeline and delivery failures end in a
//! terminal post state. [`InvalidTransition`] is a contract violation and is always
//! logged at error level by the lifecycle manager.
//!
//! Every variant reports a stable [`kind`](PipelineError::kind) string, which is what
//! admins see in failure notifications and what is stored as a post's error detail.

use thiserror::Error;

use crate::model::{AdminId, PostId, PostState};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source unreachable: {0}")]
    Unreachable(String),
    #[error("source rejected credentials: {0}")]
    Auth(String),
    #[error("could not parse source response: {0}")]
    Parse(String),
    #[error("source rate limited the request")]
    RateLimited,
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        "FetchError"
    }
}

#[derive(Debug, Error)]
#[error("dedup store unavailable: {0}")]
pub struct DedupUnavailable(pub String);

impl From<sqlx::Error> for DedupUnavailable {
    fn from(e: sqlx::Error) -> Self {
        DedupUnavailable(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("record {0} already exists")]
    Duplicate(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("download failed after {attempts} attempt(s): {reason}")]
    DownloadFailed { attempts: u32, reason: String },
    #[error("merge failed after {attempts} attempt(s): {reason}")]
    MergeFailed { attempts: u32, reason: String },
    #[error("encode failed after {attempts} attempt(s): {reason}")]
    EncodeFailed { attempts: u32, reason: String },
    #[error("output failed verification: {0}")]
    VerifyFailed(String),
    #[error("job workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::DownloadFailed { .. } => "DownloadFailed",
            PipelineError::MergeFailed { .. } => "MergeFailed",
            PipelineError::EncodeFailed { .. } => "EncodeFailed",
            PipelineError::VerifyFailed(_) => "VerifyFailed",
            PipelineError::Workspace(_) => "Workspace",
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Retrying cannot help, e.g. the bot lacks permission to post in the channel.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        "DeliveryFailed"
    }
}

#[derive(Debug, Error)]
#[error("admin notification failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event} is not allowed from {from}")]
pub struct InvalidTransition {
    pub from: PostState,
    pub event: &'static str,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("post {0} not found")]
    NotFound(PostId),
    /// Another writer moved the post between our read and our write.
    #[error("post {0} changed concurrently")]
    Conflict(PostId),
}

impl LifecycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::InvalidTransition(_) => "InvalidTransition",
            LifecycleError::Store(_) => "StoreError",
            LifecycleError::NotFound(_) => "NotFound",
            LifecycleError::Conflict(_) => "Conflict",
        }
    }
}

/// Why an admin decision was not applied.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The sender is not the admin who owns the post's rule.
    #[error("admin {admin} may not decide on post {post_id}")]
    NotAuthorized { post_id: PostId, admin: AdminId },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ApprovalError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApprovalError::NotAuthorized { .. } => "NotAuthorized",
            ApprovalError::Lifecycle(e) => e.kind(),
        }
    }
}

/// Why a single rule cycle stopped early.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Dedup(#[from] DedupUnavailable),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("rule {0} is no longer registered")]
    RuleGone(crate::model::RuleId),
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Fetch(_) => "FetchError",
            CycleError::Dedup(_) => "DedupUnavailable",
            CycleError::Lifecycle(e) => e.kind(),
            CycleError::RuleGone(_) => "RuleGone",
        }
    }
}
