//! Post lifecycle: the transition graph and the manager that owns every post write.
//!
//! # Responsibilities
//! - [`transition`] is the single source of truth for which events are legal in which
//!   state. It is pure and has no side effects.
//! - [`LifecycleManager`] applies events to stored posts with a compare-and-swap write,
//!   enforces the per-rule processing limit, expires stale approvals and rolls
//!   interrupted work back to a stable state after a restart.
//!
//! # Error Handling
//! An event that does not fit the current state yields [`InvalidTransition`], is logged
//! at error level and leaves the stored post untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::LifecycleConfig;
use crate::contract::{PostStore, StateCount};
use crate::error::{DeliveryError, InvalidTransition, LifecycleError, PipelineError, StoreError};
use crate::model::{Decision, Post, PostId, PostState, PreparedAsset, Rule, SourceItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostEvent {
    /// Dedup passed; the post is waiting on its admin.
    Submit,
    Approve,
    Reject,
    Expire,
    StartProcessing,
    ProcessingSucceeded,
    ProcessingFailed,
    Delivered,
    DeliveryFailed,
    /// Work interrupted by shutdown or a crash goes back to `Approved`.
    Requeue,
    /// Manual retry of a failed post.
    Retry,
}

impl PostEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostEvent::Submit => "submit",
            PostEvent::Approve => "approve",
            PostEvent::Reject => "reject",
            PostEvent::Expire => "expire",
            PostEvent::StartProcessing => "start_processing",
            PostEvent::ProcessingSucceeded => "processing_succeeded",
            PostEvent::ProcessingFailed => "processing_failed",
            PostEvent::Delivered => "delivered",
            PostEvent::DeliveryFailed => "delivery_failed",
            PostEvent::Requeue => "requeue",
            PostEvent::Retry => "retry",
        }
    }
}

/// Next state for `event` applied in `from`.
pub fn transition(from: PostState, event: PostEvent) -> Result<PostState, InvalidTransition> {
    use PostEvent as E;
    use PostState as S;

    let next = match (from, event) {
        (S::Discovered, E::Submit) => S::PendingApproval,
        (S::PendingApproval, E::Approve) => S::Approved,
        (S::PendingApproval, E::Reject) => S::Rejected,
        (S::PendingApproval, E::Expire) => S::Expired,
        (S::Approved, E::StartProcessing) => S::Processing,
        (S::Processing, E::ProcessingSucceeded) => S::ReadyToForward,
        (S::Processing, E::ProcessingFailed) => S::ProcessingFailed,
        (S::Processing, E::Requeue) => S::Approved,
        (S::ReadyToForward, E::Delivered) => S::Forwarded,
        (S::ReadyToForward, E::DeliveryFailed) => S::DeliveryFailed,
        (S::ProcessingFailed | S::DeliveryFailed, E::Retry) => S::Approved,
        (from, event) => {
            return Err(InvalidTransition {
                from,
                event: event.as_str(),
            })
        }
    };
    Ok(next)
}

/// What [`LifecycleManager::recover`] did on startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<PostId>,
    pub unsubmitted: Vec<PostId>,
}

pub struct LifecycleManager {
    posts: Arc<dyn PostStore>,
    config: LifecycleConfig,
    // Serialises read-compute-write so the per-rule guard sees a consistent count.
    write_lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(posts: Arc<dyn PostStore>, config: LifecycleConfig) -> Self {
        LifecycleManager {
            posts,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub async fn get(&self, id: &PostId) -> Result<Post, LifecycleError> {
        self.posts
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))
    }

    pub async fn list(&self, state: PostState) -> Result<Vec<Post>, LifecycleError> {
        Ok(self.posts.list_in_state(state).await?)
    }

    pub async fn counts(&self) -> Result<Vec<StateCount>, LifecycleError> {
        Ok(self.posts.counts().await?)
    }

    pub async fn clear(&self) -> Result<u64, LifecycleError> {
        let _held = self.write_lock.lock().await;
        Ok(self.posts.clear().await?)
    }

    /// Create the `Discovered` record for an item that just passed dedup.
    /// Returns `None` when a record with the same fingerprint already exists, which
    /// happens when a dedup record was purged and the item resurfaced.
    pub async fn discover(
        &self,
        rule: &Rule,
        item: SourceItem,
        now: DateTime<Utc>,
    ) -> Result<Option<Post>, LifecycleError> {
        let post = Post::discovered(rule.id, item, now);
        match self.posts.insert(&post).await {
            Ok(()) => {
                debug!(post_id = %post.id, rule_id = rule.id, "[LIFECYCLE] Post discovered");
                Ok(Some(post))
            }
            Err(StoreError::Duplicate(id)) => {
                info!(post_id = %id, rule_id = rule.id, "[LIFECYCLE] Post already on record, skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn submit(&self, id: &PostId, now: DateTime<Utc>) -> Result<Post, LifecycleError> {
        self.apply(id, PostEvent::Submit, |post| post.pending_since = Some(now))
            .await
    }

    /// Remember which admin message carries the approval buttons. Not a state change.
    pub async fn record_ticket(&self, id: &PostId, ticket: String) -> Result<Post, LifecycleError> {
        let _held = self.write_lock.lock().await;
        let current = self.get(id).await?;
        if current.state != PostState::PendingApproval {
            return Ok(current);
        }
        let mut next = current.clone();
        next.approval_ticket = Some(ticket);
        next.updated_at = Utc::now();
        self.write(next, current.state).await
    }

    pub async fn decide(&self, id: &PostId, decision: Decision) -> Result<Post, LifecycleError> {
        let event = match decision {
            Decision::Approved => PostEvent::Approve,
            Decision::Rejected => PostEvent::Reject,
        };
        self.apply(id, event, |post| post.decision = Some(decision))
            .await
    }

    /// Move `id` into `Processing` unless its rule is already at the processing limit.
    /// Returns `None` when deferred by the limit.
    pub async fn begin_processing(&self, id: &PostId) -> Result<Option<Post>, LifecycleError> {
        let _held = self.write_lock.lock().await;
        let current = self.get(id).await?;
        let next_state = self.checked(&current, PostEvent::StartProcessing)?;

        let in_flight = self
            .posts
            .count_in_state(current.rule_id, PostState::Processing)
            .await?;
        if in_flight >= self.config.per_rule_processing_limit {
            debug!(
                post_id = %id,
                rule_id = current.rule_id,
                in_flight,
                limit = self.config.per_rule_processing_limit,
                "[LIFECYCLE] Processing deferred by per-rule limit"
            );
            return Ok(None);
        }

        let mut next = current.clone();
        next.state = next_state;
        next.updated_at = Utc::now();
        self.write(next, current.state).await.map(Some)
    }

    pub async fn complete_processing(
        &self,
        id: &PostId,
        asset: PreparedAsset,
    ) -> Result<Post, LifecycleError> {
        self.apply(id, PostEvent::ProcessingSucceeded, |post| {
            post.asset = Some(asset);
            post.error = None;
        })
        .await
    }

    pub async fn fail_processing(
        &self,
        id: &PostId,
        failure: &PipelineError,
    ) -> Result<Post, LifecycleError> {
        let detail = format!("{}: {failure}", failure.kind());
        self.apply(id, PostEvent::ProcessingFailed, |post| post.error = Some(detail))
            .await
    }

    pub async fn mark_forwarded(&self, id: &PostId) -> Result<Post, LifecycleError> {
        self.apply(id, PostEvent::Delivered, |post| post.error = None)
            .await
    }

    pub async fn fail_delivery(
        &self,
        id: &PostId,
        failure: &DeliveryError,
    ) -> Result<Post, LifecycleError> {
        let detail = format!("{}: {failure}", failure.kind());
        self.apply(id, PostEvent::DeliveryFailed, |post| post.error = Some(detail))
            .await
    }

    pub async fn requeue(&self, id: &PostId) -> Result<Post, LifecycleError> {
        self.apply(id, PostEvent::Requeue, |_| {}).await
    }

    /// Put a failed post back to `Approved` so it is prepared and delivered again.
    pub async fn retry(&self, id: &PostId) -> Result<Post, LifecycleError> {
        self.apply(id, PostEvent::Retry, |post| {
            post.error = None;
            post.asset = None;
        })
        .await
    }

    /// Expire every pending post whose approval window has closed by `now`.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Post>, LifecycleError> {
        let mut expired = Vec::new();
        for post in self.posts.list_in_state(PostState::PendingApproval).await? {
            let since = post.pending_since.unwrap_or(post.discovered_at);
            let overdue = (now - since)
                .to_std()
                .is_ok_and(|waited| waited >= self.config.approval_timeout);
            if !overdue {
                continue;
            }
            match self.apply(&post.id, PostEvent::Expire, |_| {}).await {
                Ok(post) => {
                    info!(post_id = %post.id, rule_id = post.rule_id, "[LIFECYCLE] Approval window closed, post expired");
                    expired.push(post);
                }
                // Decided between the listing and the write.
                Err(LifecycleError::InvalidTransition(_)) | Err(LifecycleError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Restore a consistent picture after a restart: nothing is left in `Processing`.
    pub async fn recover(&self) -> Result<RecoveryReport, LifecycleError> {
        let mut report = RecoveryReport::default();
        for post in self.posts.list_in_state(PostState::Processing).await? {
            self.requeue(&post.id).await?;
            warn!(post_id = %post.id, rule_id = post.rule_id, "[LIFECYCLE] Interrupted processing requeued as approved");
            report.requeued.push(post.id);
        }
        for post in self.posts.list_in_state(PostState::Discovered).await? {
            report.unsubmitted.push(post.id);
        }
        info!(
            requeued = report.requeued.len(),
            unsubmitted = report.unsubmitted.len(),
            "[LIFECYCLE] Recovery complete"
        );
        Ok(report)
    }

    async fn apply<F>(&self, id: &PostId, event: PostEvent, mutate: F) -> Result<Post, LifecycleError>
    where
        F: FnOnce(&mut Post),
    {
        let _held = self.write_lock.lock().await;
        let current = self.get(id).await?;
        let next_state = self.checked(&current, event)?;
        let mut next = current.clone();
        next.state = next_state;
        next.updated_at = Utc::now();
        mutate(&mut next);
        let written = self.write(next, current.state).await?;
        debug!(
            post_id = %id,
            from = %current.state,
            to = %written.state,
            event = event.as_str(),
            "[LIFECYCLE] Transition applied"
        );
        Ok(written)
    }

    fn checked(&self, post: &Post, event: PostEvent) -> Result<PostState, LifecycleError> {
        transition(post.state, event).map_err(|e| {
            error!(post_id = %post.id, rule_id = post.rule_id, error = %e, "[LIFECYCLE] Rejected invalid transition");
            LifecycleError::from(e)
        })
    }

    async fn write(&self, next: Post, expected: PostState) -> Result<Post, LifecycleError> {
        if self.posts.replace(&next, expected).await? {
            Ok(next)
        } else {
            warn!(post_id = %next.id, "[LIFECYCLE] Post changed underneath a transition");
            Err(LifecycleError::Conflict(next.id))
        }
    }
}
