//! # contract: collaborator interfaces consumed by the relay core
//!
//! This module defines the seams between the core and everything it does not own:
//! the source platform, the destination channel, the admin chat, the persistent stores
//! and the media pipeline.
//!
//! ## Interface & Extensibility
//! - Implement [`SourceClient`] to pull candidates from a new source platform.
//! - Implement [`Destination`] and [`AdminNotifier`] for a new chat platform.
//! - Implement [`DedupStore`], [`PostStore`] and [`RuleStore`] for a new backend. The
//!   core ships a sqlite and an in-memory implementation in [`crate::store`].
//! - All methods are async and return the typed errors from [`crate::error`].
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the mocks are exported with the
//!   `test-export-mocks` feature (on by default) so integration tests and the binary
//!   crate can script collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{DedupUnavailable, DeliveryError, FetchError, NotifyError, PipelineError, StoreError};
use crate::model::{
    AdminId, NewRule, Post, PostId, PostMetadata, PostState, PreparedAsset, Rule, RuleId, SourceItem,
};

/// Rendered summary shown to the admin next to the approve/reject buttons.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub post_id: PostId,
    pub text: String,
    /// Direct media link the chat client may embed, when one exists.
    pub media_url: Option<String>,
}

/// Handle returned by [`AdminNotifier::present_for_approval`]. The decision itself
/// arrives later, addressed by post id, on the approval gateway's decision channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalTicket(pub String);

/// Number of posts in one state for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCount {
    pub rule_id: RuleId,
    pub state: PostState,
    pub count: u64,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Newest candidates for the rule's subreddit and sort mode, at most `rule.max_items`.
    async fn fetch_candidates(&self, rule: &Rule) -> Result<Vec<SourceItem>, FetchError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Destination: Send + Sync {
    /// Deliver a prepared local asset to `channel`.
    async fn deliver(
        &self,
        channel: &str,
        asset: &PreparedAsset,
        metadata: &PostMetadata,
    ) -> Result<(), DeliveryError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    /// Show a pending post to its admin. Must return promptly; it never waits for the decision.
    async fn present_for_approval(
        &self,
        admin: AdminId,
        post: &Post,
        preview: &Preview,
    ) -> Result<ApprovalTicket, NotifyError>;

    /// Health and failure reports.
    async fn notify(&self, admin: AdminId, message: &str) -> Result<(), NotifyError>;
}

/// Turns an approved post into a delivery-ready asset.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MediaPreparer: Send + Sync {
    async fn prepare(&self, post: &Post) -> Result<PreparedAsset, PipelineError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Record `(rule, item_id)` if it was never seen and report whether it was new.
    /// A single atomic check-and-set: concurrent callers for one key see exactly one `true`.
    async fn is_new(
        &self,
        rule: RuleId,
        item_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, DedupUnavailable>;

    /// Drop records first seen before `cutoff`. Returns how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DedupUnavailable>;

    async fn clear(&self) -> Result<u64, DedupUnavailable>;
}

/// Persistence for post records. Only the lifecycle manager writes through this trait.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] when the id is already present.
    async fn insert(&self, post: &Post) -> Result<(), StoreError>;

    async fn get(&self, id: &PostId) -> Result<Option<Post>, StoreError>;

    /// Overwrite the record only if its stored state is still `expected`.
    /// Returns `false` when another writer got there first.
    async fn replace(&self, post: &Post, expected: PostState) -> Result<bool, StoreError>;

    /// Posts in `state`, oldest `updated_at` first.
    async fn list_in_state(&self, state: PostState) -> Result<Vec<Post>, StoreError>;

    async fn count_in_state(&self, rule: RuleId, state: PostState) -> Result<u64, StoreError>;

    async fn counts(&self) -> Result<Vec<StateCount>, StoreError>;

    async fn clear(&self) -> Result<u64, StoreError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create_rule(&self, rule: &NewRule, created_at: DateTime<Utc>) -> Result<Rule, StoreError>;

    async fn save_rule(&self, rule: &Rule) -> Result<(), StoreError>;

    async fn load_rules(&self) -> Result<Vec<Rule>, StoreError>;
}
