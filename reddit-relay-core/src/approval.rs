//! Approval gateway: puts pending posts in front of their admin and turns the admin's
//! answer back into a lifecycle event.
//!
//! Presenting a post never waits for the answer. Decisions arrive later as
//! [`DecisionMessage`]s addressed by post id, either through the channel returned by
//! [`ApprovalGateway::channel`] or by a direct [`ApprovalGateway::resolve`] call.
//! Only the admin who owns the post's rule may decide; anyone else is refused and the
//! post stays where it is. Expiry is handled by the lifecycle sweep and does not
//! involve this module.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contract::{AdminNotifier, Preview};
use crate::error::{ApprovalError, LifecycleError};
use crate::lifecycle::LifecycleManager;
use crate::model::{AdminId, Decision, MediaType, Post, PostId, PostState, Rule};
use crate::registry::RuleRegistry;

/// An admin's answer for one specific post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionMessage {
    pub post_id: PostId,
    pub decision: Decision,
    /// Who pressed the button.
    pub admin: AdminId,
}

pub struct ApprovalGateway {
    lifecycle: Arc<LifecycleManager>,
    notifier: Arc<dyn AdminNotifier>,
    registry: RuleRegistry,
    approved: Arc<Notify>,
    // Posts with a presentation in progress, so the sweep never shows one twice.
    presenting: DashSet<PostId>,
}

impl ApprovalGateway {
    /// `approved` is signalled after every approval so the dispatcher can pick the post up.
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        notifier: Arc<dyn AdminNotifier>,
        registry: RuleRegistry,
        approved: Arc<Notify>,
    ) -> Self {
        ApprovalGateway {
            lifecycle,
            notifier,
            registry,
            approved,
            presenting: DashSet::new(),
        }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<DecisionMessage>, mpsc::Receiver<DecisionMessage>) {
        mpsc::channel(capacity.max(1))
    }

    /// Move a freshly discovered post to `PendingApproval` and show it to the rule owner.
    /// A failed notification leaves the post pending without a ticket; the sweep
    /// presents it again.
    pub async fn present(&self, rule: &Rule, post: Post) -> Result<Post, LifecycleError> {
        if !self.presenting.insert(post.id.clone()) {
            return Ok(post);
        }
        let id = post.id.clone();
        let result = self.present_now(rule, post).await;
        self.presenting.remove(&id);
        result
    }

    async fn present_now(&self, rule: &Rule, post: Post) -> Result<Post, LifecycleError> {
        let post = if post.state == PostState::Discovered {
            self.lifecycle.submit(&post.id, Utc::now()).await?
        } else {
            post
        };

        let preview = render_preview(rule, &post);
        match self.notifier.present_for_approval(rule.owner, &post, &preview).await {
            Ok(ticket) => {
                info!(post_id = %post.id, rule_id = rule.id, admin = rule.owner, "[APPROVAL] Post presented for approval");
                self.lifecycle.record_ticket(&post.id, ticket.0).await
            }
            Err(e) => {
                warn!(post_id = %post.id, rule_id = rule.id, error = %e, "[APPROVAL] Could not present post, will retry on next sweep");
                Ok(post)
            }
        }
    }

    /// Present every pending post whose presentation never reached the admin.
    pub async fn present_outstanding(&self) -> Result<usize, LifecycleError> {
        let outstanding: Vec<Post> = self
            .lifecycle
            .list(PostState::PendingApproval)
            .await?
            .into_iter()
            .filter(|p| p.approval_ticket.is_none() && !self.presenting.contains(&p.id))
            .collect();
        Ok(self.present_all(outstanding).await)
    }

    /// Present posts a previous process discovered but never submitted. Only safe
    /// before any cycle runs.
    pub async fn present_recovered(&self, ids: &[PostId]) -> Result<usize, LifecycleError> {
        let mut posts = Vec::with_capacity(ids.len());
        for id in ids {
            posts.push(self.lifecycle.get(id).await?);
        }
        Ok(self.present_all(posts).await)
    }

    async fn present_all(&self, posts: Vec<Post>) -> usize {
        let mut presented = 0;
        for post in posts {
            let Some(rule) = self.registry.get(post.rule_id) else {
                warn!(post_id = %post.id, rule_id = post.rule_id, "[APPROVAL] Pending post belongs to an unknown rule");
                continue;
            };
            match self.present(&rule, post).await {
                Ok(post) if post.approval_ticket.is_some() => presented += 1,
                Ok(_) => {}
                Err(e) => warn!(error = %e, kind = e.kind(), "[APPROVAL] Outstanding post not presented"),
            }
        }
        presented
    }

    /// Apply `admin`'s decision. Refused without any state change when `admin` does not
    /// own the post's rule, or when the post is no longer pending.
    pub async fn resolve(&self, admin: AdminId, post_id: &PostId, decision: Decision) -> Result<Post, ApprovalError> {
        let post = self.lifecycle.get(post_id).await?;
        let owner = self.registry.get(post.rule_id).map(|rule| rule.owner);
        if owner != Some(admin) {
            warn!(post_id = %post_id, admin, ?owner, "[APPROVAL] Decision from someone other than the rule owner refused");
            return Err(ApprovalError::NotAuthorized {
                post_id: post_id.clone(),
                admin,
            });
        }

        let post = self.lifecycle.decide(post_id, decision).await?;
        info!(post_id = %post_id, admin, decision = decision.as_str(), "[APPROVAL] Decision recorded");
        if decision == Decision::Approved {
            self.approved.notify_one();
        }
        Ok(post)
    }

    /// Consume decisions until cancelled or every sender is gone. The receiver is handed
    /// back so a later run can pick up where this one stopped.
    pub async fn run(
        self: Arc<Self>,
        mut decisions: mpsc::Receiver<DecisionMessage>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<DecisionMessage> {
        info!("[APPROVAL] Decision loop started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = decisions.recv() => message,
            };
            let Some(message) = message else {
                debug!("[APPROVAL] All decision senders dropped");
                break;
            };
            if let Err(e) = self.resolve(message.admin, &message.post_id, message.decision).await {
                error!(post_id = %message.post_id, error = %e, kind = e.kind(), "[APPROVAL] Failed to apply decision");
                let reply = refusal_text(&message, &e);
                if let Err(e) = self.notifier.notify(message.admin, &reply).await {
                    warn!(post_id = %message.post_id, admin = message.admin, error = %e, "[APPROVAL] Could not tell admin the decision was refused");
                }
            }
        }
        info!("[APPROVAL] Decision loop stopped");
        decisions
    }
}

/// What the sender of a refused decision is told.
fn refusal_text(message: &DecisionMessage, error: &ApprovalError) -> String {
    let id = &message.post_id;
    match error {
        ApprovalError::NotAuthorized { .. } => format!("Not authorized: only the rule's admin can decide on post {id}."),
        ApprovalError::Lifecycle(LifecycleError::InvalidTransition(t)) => {
            format!("Post {id} was not {}: it is already {}.", message.decision.as_str(), t.from)
        }
        ApprovalError::Lifecycle(e) => format!("Post {id} was not {}: {e}", message.decision.as_str()),
    }
}

/// Text shown to the admin next to the approve/reject buttons.
pub fn render_preview(rule: &Rule, post: &Post) -> Preview {
    let meta = &post.metadata;
    let mut text = format!("New {} post from r/{}\n\n", post.media_type.as_str(), rule.subreddit);
    if !meta.title.is_empty() {
        text.push_str(&meta.title);
        text.push('\n');
    }
    if !meta.author.is_empty() {
        text.push_str(&format!("by u/{} | score {}\n", meta.author, meta.score));
    }
    if meta.permalink.starts_with("http") {
        text.push_str(&format!("{}\n", meta.permalink));
    } else if !meta.permalink.is_empty() {
        text.push_str(&format!("https://reddit.com{}\n", meta.permalink));
    }
    text.push_str(&format!("\nTarget: {} | rule #{}", rule.channel, rule.id));

    let media_url = match post.media_type {
        MediaType::Image | MediaType::Gallery => post.media_urls.first().cloned(),
        MediaType::Video | MediaType::Text => None,
    };
    Preview {
        post_id: post.id.clone(),
        text,
        media_url,
    }
}
