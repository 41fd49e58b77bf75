//! Dispatcher: moves approved posts through the media pipeline and on to the destination.
//!
//! Approved posts are taken oldest first. A post only starts when a job slot is free
//! and its rule is below the per-rule processing limit; everything else waits for the
//! next pass. Passes run on every approval, every finished job and on a fixed rescan
//! interval.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::contract::{AdminNotifier, Destination, MediaPreparer};
use crate::error::{DeliveryError, LifecycleError};
use crate::lifecycle::LifecycleManager;
use crate::model::{Post, PostId, PostState};
use crate::registry::RuleRegistry;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrent_jobs: usize,
    pub delivery: DeliveryConfig,
    pub rescan: Duration,
    pub shutdown_grace: Duration,
}

pub struct Dispatcher {
    lifecycle: Arc<LifecycleManager>,
    preparer: Arc<dyn MediaPreparer>,
    destination: Arc<dyn Destination>,
    notifier: Arc<dyn AdminNotifier>,
    registry: RuleRegistry,
    wake: Arc<Notify>,
    slots: Arc<Semaphore>,
    in_flight: Arc<DashSet<PostId>>,
    settings: DispatchSettings,
}

/// Marks a post as owned by a running job until dropped, including on panic.
struct InFlight {
    set: Arc<DashSet<PostId>>,
    id: PostId,
}

impl InFlight {
    fn claim(set: &Arc<DashSet<PostId>>, id: &PostId) -> Option<Self> {
        set.insert(id.clone()).then(|| InFlight {
            set: Arc::clone(set),
            id: id.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

impl Dispatcher {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        preparer: Arc<dyn MediaPreparer>,
        destination: Arc<dyn Destination>,
        notifier: Arc<dyn AdminNotifier>,
        registry: RuleRegistry,
        wake: Arc<Notify>,
        settings: DispatchSettings,
    ) -> Self {
        Dispatcher {
            lifecycle,
            preparer,
            destination,
            notifier,
            registry,
            wake,
            slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            in_flight: Arc::new(DashSet::new()),
            settings,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut jobs: JoinSet<()> = JoinSet::new();
        info!(max_concurrent_jobs = self.settings.max_concurrent_jobs, "[DISPATCH] Dispatcher started");

        loop {
            if let Err(e) = self.dispatch_pending(&mut jobs).await {
                error!(error = %e, kind = e.kind(), "[DISPATCH] Dispatch pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.rescan) => {}
                Some(joined) = jobs.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "[DISPATCH] Job task panicked");
                    }
                }
            }
        }

        self.shut_down(jobs).await;
    }

    async fn dispatch_pending(self: &Arc<Self>, jobs: &mut JoinSet<()>) -> Result<(), LifecycleError> {
        // Prepared but undelivered, e.g. after a restart.
        for post in self.lifecycle.list(PostState::ReadyToForward).await? {
            if let Some(claim) = InFlight::claim(&self.in_flight, &post.id) {
                info!(post_id = %post.id, "[DISPATCH] Resuming delivery of prepared post");
                let this = Arc::clone(self);
                jobs.spawn(async move {
                    let _claim = claim;
                    this.deliver(post).await;
                });
            }
        }

        for post in self.lifecycle.list(PostState::Approved).await? {
            if self.in_flight.contains(&post.id) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!("[DISPATCH] All job slots busy");
                break;
            };
            let Some(claim) = InFlight::claim(&self.in_flight, &post.id) else {
                continue;
            };
            match self.lifecycle.begin_processing(&post.id).await {
                Ok(Some(post)) => {
                    info!(post_id = %post.id, rule_id = post.rule_id, "[DISPATCH] Processing started");
                    let this = Arc::clone(self);
                    jobs.spawn(async move {
                        let _claim = claim;
                        this.process(post, permit).await;
                    });
                }
                // Rule at its processing limit.
                Ok(None) => {}
                Err(LifecycleError::InvalidTransition(_)) | Err(LifecycleError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn process(&self, post: Post, permit: OwnedSemaphorePermit) {
        let prepared = self.preparer.prepare(&post).await;
        let ready = match prepared {
            Ok(asset) => match self.lifecycle.complete_processing(&post.id, asset).await {
                Ok(ready) => Some(ready),
                Err(e) => {
                    error!(post_id = %post.id, error = %e, kind = e.kind(), "[DISPATCH] Could not record prepared asset");
                    None
                }
            },
            Err(failure) => {
                if let Err(e) = self.lifecycle.fail_processing(&post.id, &failure).await {
                    error!(post_id = %post.id, error = %e, kind = e.kind(), "[DISPATCH] Could not record processing failure");
                }
                self.notify_failure(&post, failure.kind(), &failure.to_string()).await;
                None
            }
        };
        drop(permit);
        self.wake.notify_one();

        if let Some(ready) = ready {
            self.deliver(ready).await;
        }
    }

    async fn deliver(&self, post: Post) {
        let outcome = match (post.asset.as_ref(), self.registry.get(post.rule_id)) {
            (None, _) => Err(DeliveryError::Permanent("post has no prepared asset".to_string())),
            (_, None) => Err(DeliveryError::Permanent(format!("rule {} no longer exists", post.rule_id))),
            (Some(asset), Some(rule)) => {
                let attempts = self.settings.delivery.attempts.max(1);
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match self.destination.deliver(&rule.channel, asset, &post.metadata).await {
                        Ok(()) => break Ok(()),
                        Err(e) if e.is_transient() && attempt < attempts => {
                            warn!(post_id = %post.id, attempt, error = %e, "[DISPATCH] Transient delivery failure, retrying");
                            tokio::time::sleep(self.settings.delivery.retry_delay * attempt).await;
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.lifecycle.mark_forwarded(&post.id).await {
                    error!(post_id = %post.id, error = %e, kind = e.kind(), "[DISPATCH] Delivered but could not record it");
                    return;
                }
                info!(post_id = %post.id, rule_id = post.rule_id, "[DISPATCH] Post forwarded");
                if let Some(asset) = &post.asset {
                    if let Err(e) = tokio::fs::remove_dir_all(&asset.root).await {
                        warn!(post_id = %post.id, error = %e, "[DISPATCH] Could not remove delivered asset");
                    }
                }
            }
            Err(failure) => {
                error!(post_id = %post.id, error = %failure, "[DISPATCH] Delivery failed");
                if let Err(e) = self.lifecycle.fail_delivery(&post.id, &failure).await {
                    error!(post_id = %post.id, error = %e, kind = e.kind(), "[DISPATCH] Could not record delivery failure");
                }
                self.notify_failure(&post, failure.kind(), &failure.to_string()).await;
            }
        }
    }

    async fn notify_failure(&self, post: &Post, kind: &str, detail: &str) {
        let Some(rule) = self.registry.get(post.rule_id) else {
            return;
        };
        let message = format!(
            "Post failed ({kind}): {}\nRule #{} (r/{})\n{detail}\nPost id: {}",
            post.metadata.title, rule.id, rule.subreddit, post.id
        );
        if let Err(e) = self.notifier.notify(rule.owner, &message).await {
            warn!(post_id = %post.id, error = %e, "[DISPATCH] Could not notify admin of failure");
        }
    }

    /// Give running jobs `shutdown_grace` to finish, then interrupt the rest and put any
    /// post still in `Processing` back to `Approved`.
    async fn shut_down(&self, mut jobs: JoinSet<()>) {
        if !jobs.is_empty() {
            info!(jobs = jobs.len(), grace_secs = self.settings.shutdown_grace.as_secs(), "[DISPATCH] Waiting for running jobs");
            let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
                while jobs.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(jobs = jobs.len(), "[DISPATCH] Grace period over, interrupting jobs");
                jobs.abort_all();
                while jobs.join_next().await.is_some() {}
            }
        }

        match self.lifecycle.list(PostState::Processing).await {
            Ok(interrupted) => {
                for post in interrupted {
                    match self.lifecycle.requeue(&post.id).await {
                        Ok(_) => info!(post_id = %post.id, "[DISPATCH] Interrupted job requeued"),
                        Err(e) => error!(post_id = %post.id, error = %e, "[DISPATCH] Could not requeue interrupted job"),
                    }
                }
            }
            Err(e) => error!(error = %e, "[DISPATCH] Could not list interrupted jobs"),
        }
        info!("[DISPATCH] Dispatcher stopped");
    }
}
