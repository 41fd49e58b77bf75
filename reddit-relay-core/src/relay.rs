//! The assembled relay: stores, collaborators and the background tasks that tie them
//! together.
//!
//! [`RelayAdmin`] covers the operations that only touch persisted state (status, rule
//! edits, clearing history, retrying a failed post) and works without any network
//! collaborator, so the command line can use it against the database of a relay that
//! runs elsewhere. [`Relay`] adds the scheduler, dispatcher, decision loop and sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::approval::{ApprovalGateway, DecisionMessage};
use crate::config::{ConfigError, LifecycleConfig, RelayConfig};
use crate::contract::{AdminNotifier, DedupStore, Destination, MediaPreparer, PostStore, RuleStore, SourceClient};
use crate::cycle::CycleRunner;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::error::{ApprovalError, DedupUnavailable, LifecycleError, StoreError};
use crate::lifecycle::{LifecycleManager, RecoveryReport};
use crate::media::remove_workspaces;
use crate::model::{AdminId, Decision, NewRule, Post, PostId, PostState, Rule, RuleId};
use crate::registry::{RegistryError, RuleRegistry};
use crate::scheduler::{HealthBook, RuleHealth, Scheduler};
use crate::store::{MemoryStore, SqliteStore};

const DECISION_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dedup(#[from] DedupUnavailable),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay is already running")]
    AlreadyRunning,
    #[error("relay is not running")]
    NotRunning,
}

/// Persistence backends. One store usually plays all three roles.
#[derive(Clone)]
pub struct RelayStores {
    pub dedup: Arc<dyn DedupStore>,
    pub posts: Arc<dyn PostStore>,
    pub rules: Arc<dyn RuleStore>,
}

impl RelayStores {
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        RelayStores {
            dedup: store.clone(),
            posts: store.clone(),
            rules: store,
        }
    }

    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        RelayStores {
            dedup: store.clone(),
            posts: store.clone(),
            rules: store,
        }
    }
}

/// The outside world.
#[derive(Clone)]
pub struct RelayCollaborators {
    pub source: Arc<dyn SourceClient>,
    pub destination: Arc<dyn Destination>,
    pub notifier: Arc<dyn AdminNotifier>,
    pub preparer: Arc<dyn MediaPreparer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub subreddit: String,
    pub channel: String,
    pub sort: String,
    pub enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub posts: BTreeMap<String, u64>,
    pub health: RuleHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub running: bool,
    pub rules: usize,
    pub enabled_rules: usize,
    pub posts_by_state: BTreeMap<String, u64>,
    pub per_rule: BTreeMap<RuleId, RuleStatus>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub dedup_records: u64,
    pub posts: u64,
    pub workspaces: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub presented: usize,
    pub purged: u64,
}

pub struct RelayAdmin {
    config: RelayConfig,
    dedup: Arc<dyn DedupStore>,
    lifecycle: Arc<LifecycleManager>,
    registry: RuleRegistry,
}

impl RelayAdmin {
    pub async fn open(config: RelayConfig, stores: RelayStores) -> Result<Self, RelayError> {
        let registry = RuleRegistry::load(stores.rules).await?;
        let lifecycle = Arc::new(LifecycleManager::new(stores.posts, config.lifecycle.clone()));
        Ok(RelayAdmin {
            config,
            dedup: stores.dedup,
            lifecycle,
            registry,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.registry.snapshot()
    }

    pub async fn add_rule(&self, rule: NewRule) -> Result<Rule, RelayError> {
        Ok(self.registry.add(rule).await?)
    }

    pub async fn update_rule(&self, rule: Rule) -> Result<Rule, RelayError> {
        Ok(self.registry.update(rule).await?)
    }

    pub async fn set_rule_enabled(&self, id: RuleId, enabled: bool) -> Result<Rule, RelayError> {
        Ok(self.registry.set_enabled(id, enabled).await?)
    }

    pub async fn post(&self, id: &PostId) -> Result<Post, RelayError> {
        Ok(self.lifecycle.get(id).await?)
    }

    pub async fn posts_in_state(&self, state: PostState) -> Result<Vec<Post>, RelayError> {
        Ok(self.lifecycle.list(state).await?)
    }

    /// Send a failed post back to `Approved`. A running relay picks it up on its next pass.
    pub async fn retry(&self, id: &PostId) -> Result<Post, RelayError> {
        let post = self.lifecycle.retry(id).await?;
        info!(post_id = %id, rule_id = post.rule_id, "[RELAY] Post queued for retry");
        Ok(post)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        self.status_with(None, false).await
    }

    async fn status_with(&self, health: Option<&HealthBook>, running: bool) -> Result<RelayStatus, RelayError> {
        let rules = self.registry.snapshot();
        let mut posts_by_state = empty_state_counts();
        let mut per_rule: BTreeMap<RuleId, RuleStatus> = rules
            .iter()
            .map(|rule| {
                let status = RuleStatus {
                    subreddit: rule.subreddit.clone(),
                    channel: rule.channel.clone(),
                    sort: rule.sort.as_str().to_string(),
                    enabled: rule.enabled,
                    last_checked_at: rule.last_checked_at,
                    posts: empty_state_counts(),
                    health: health.map(|h| h.get(rule.id)).unwrap_or_default(),
                };
                (rule.id, status)
            })
            .collect();

        for count in self.lifecycle.counts().await? {
            *posts_by_state.entry(count.state.to_string()).or_default() += count.count;
            if let Some(rule) = per_rule.get_mut(&count.rule_id) {
                *rule.posts.entry(count.state.to_string()).or_default() += count.count;
            }
        }

        Ok(RelayStatus {
            running,
            rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            posts_by_state,
            per_rule,
        })
    }

    /// Forget every dedup record and post, delete prepared assets and leftover job
    /// workspaces, and make every rule due on the next scheduler pass. Rules stay.
    pub async fn clear_history(&self) -> Result<ClearReport, RelayError> {
        let dedup_records = self.dedup.clear().await?;
        let posts = self.lifecycle.clear().await?;
        self.registry.reset_checked().await?;

        let assets_dir = &self.config.pipeline.assets_dir;
        match tokio::fs::remove_dir_all(assets_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let workspaces = remove_workspaces(&self.config.pipeline.work_dir).await?;

        let report = ClearReport {
            dedup_records,
            posts,
            workspaces,
        };
        warn!(
            dedup_records = report.dedup_records,
            posts = report.posts,
            workspaces = report.workspaces,
            "[RELAY] History cleared"
        );
        Ok(report)
    }
}

fn empty_state_counts() -> BTreeMap<String, u64> {
    PostState::ALL.iter().map(|s| (s.to_string(), 0)).collect()
}

/// Periodic housekeeping: expiry, re-presenting, dedup retention and registry reload.
struct Sweeper {
    lifecycle: Arc<LifecycleManager>,
    gateway: Arc<ApprovalGateway>,
    dedup: Arc<dyn DedupStore>,
    registry: RuleRegistry,
    config: LifecycleConfig,
}

impl Sweeper {
    async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        match self.lifecycle.expire_overdue(now).await {
            Ok(expired) => report.expired = expired.len(),
            Err(e) => error!(error = %e, kind = e.kind(), "[RELAY] Expiry sweep failed"),
        }
        match self.gateway.present_outstanding().await {
            Ok(presented) => report.presented = presented,
            Err(e) => error!(error = %e, kind = e.kind(), "[RELAY] Could not re-present pending posts"),
        }
        let cutoff = chrono::Duration::from_std(self.config.dedup_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            match self.dedup.purge_older_than(cutoff).await {
                Ok(purged) => report.purged = purged,
                Err(e) => error!(error = %e, "[RELAY] Dedup retention purge failed"),
            }
        }
        if let Err(e) = self.registry.reload().await {
            error!(error = %e, "[RELAY] Could not reload rules");
        }
        report
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.sweep().await;
            if report != SweepReport::default() {
                info!(expired = report.expired, presented = report.presented, purged = report.purged, "[RELAY] Sweep done");
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    decisions: JoinHandle<mpsc::Receiver<DecisionMessage>>,
}

pub struct Relay {
    admin: RelayAdmin,
    gateway: Arc<ApprovalGateway>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    wake: Arc<Notify>,
    decision_tx: mpsc::Sender<DecisionMessage>,
    decision_rx: Mutex<Option<mpsc::Receiver<DecisionMessage>>>,
    running: Mutex<Option<Running>>,
}

impl Relay {
    pub async fn new(
        config: RelayConfig,
        stores: RelayStores,
        collaborators: RelayCollaborators,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let dedup = Arc::clone(&stores.dedup);
        let admin = RelayAdmin::open(config, stores).await?;
        let config = admin.config.clone();
        let wake = Arc::new(Notify::new());

        let gateway = Arc::new(ApprovalGateway::new(
            Arc::clone(&admin.lifecycle),
            Arc::clone(&collaborators.notifier),
            admin.registry.clone(),
            Arc::clone(&wake),
        ));
        let cycle = Arc::new(CycleRunner::new(
            collaborators.source,
            dedup,
            Arc::clone(&admin.lifecycle),
            Arc::clone(&gateway),
        ));
        let scheduler = Arc::new(Scheduler::new(
            admin.registry.clone(),
            cycle,
            Arc::clone(&collaborators.notifier),
            config.scheduler.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&admin.lifecycle),
            collaborators.preparer,
            collaborators.destination,
            collaborators.notifier,
            admin.registry.clone(),
            Arc::clone(&wake),
            DispatchSettings {
                max_concurrent_jobs: config.pipeline.max_concurrent_jobs,
                delivery: config.delivery.clone(),
                rescan: config.lifecycle.sweep_interval,
                shutdown_grace: config.scheduler.shutdown_grace,
            },
        ));
        let (decision_tx, decision_rx) = ApprovalGateway::channel(DECISION_QUEUE);

        Ok(Relay {
            admin,
            gateway,
            scheduler,
            dispatcher,
            wake,
            decision_tx,
            decision_rx: Mutex::new(Some(decision_rx)),
            running: Mutex::new(None),
        })
    }

    pub fn admin(&self) -> &RelayAdmin {
        &self.admin
    }

    /// Where inbound admin decisions go, e.g. from a button-press poller.
    pub fn decision_sender(&self) -> mpsc::Sender<DecisionMessage> {
        self.decision_tx.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Recover interrupted work, then start the scheduler, dispatcher, decision loop and sweeper.
    pub async fn start(&self) -> Result<RecoveryReport, RelayError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }
        let decision_rx = self.decision_rx.lock().await.take().ok_or(RelayError::AlreadyRunning)?;

        match remove_workspaces(&self.admin.config.pipeline.work_dir).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "[RELAY] Could not sweep stale job workspaces"),
        }
        let report = match self.admin.lifecycle.recover().await {
            Ok(report) => report,
            Err(e) => {
                *self.decision_rx.lock().await = Some(decision_rx);
                return Err(e.into());
            }
        };

        if !report.unsubmitted.is_empty() {
            match self.gateway.present_recovered(&report.unsubmitted).await {
                Ok(presented) => info!(presented, "[RELAY] Presented posts left unsubmitted by the last run"),
                Err(e) => warn!(error = %e, "[RELAY] Could not present recovered posts"),
            }
        }

        let cancel = CancellationToken::new();
        let sweeper = Sweeper {
            lifecycle: Arc::clone(&self.admin.lifecycle),
            gateway: Arc::clone(&self.gateway),
            dedup: Arc::clone(&self.admin.dedup),
            registry: self.admin.registry.clone(),
            config: self.admin.config.lifecycle.clone(),
        };
        *running = Some(Running {
            scheduler: tokio::spawn(Arc::clone(&self.scheduler).run(cancel.clone())),
            dispatcher: tokio::spawn(Arc::clone(&self.dispatcher).run(cancel.clone())),
            sweeper: tokio::spawn(sweeper.run(cancel.clone())),
            decisions: tokio::spawn(Arc::clone(&self.gateway).run(decision_rx, cancel.clone())),
            cancel,
        });
        info!(rules = self.admin.registry.enabled_ids().len(), "[RELAY] Relay started");
        Ok(report)
    }

    /// Stop accepting new work and wait for the background tasks. Running cycles finish;
    /// media jobs get the configured grace period and are rolled back to `Approved` after it.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(RelayError::NotRunning);
        };
        info!("[RELAY] Stopping relay");
        running.cancel.cancel();

        let (scheduler, dispatcher, sweeper, decisions) =
            tokio::join!(running.scheduler, running.dispatcher, running.sweeper, running.decisions);
        for (task, joined) in [("scheduler", scheduler), ("dispatcher", dispatcher), ("sweeper", sweeper)] {
            if let Err(e) = joined {
                error!(task, error = %e, "[RELAY] Background task ended abnormally");
            }
        }
        match decisions {
            Ok(rx) => *self.decision_rx.lock().await = Some(rx),
            Err(e) => error!(task = "decisions", error = %e, "[RELAY] Background task ended abnormally"),
        }
        info!("[RELAY] Relay stopped");
        Ok(())
    }

    /// Apply `admin`'s decision directly, bypassing the decision queue.
    pub async fn resolve(&self, admin: AdminId, post_id: &PostId, decision: Decision) -> Result<Post, RelayError> {
        Ok(self.gateway.resolve(admin, post_id, decision).await?)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let running = self.is_running().await;
        let health = self.scheduler.health();
        self.admin.status_with(Some(health.as_ref()), running).await
    }

    pub async fn clear_history(&self) -> Result<ClearReport, RelayError> {
        self.admin.clear_history().await
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.admin.rules()
    }

    pub async fn add_rule(&self, rule: NewRule) -> Result<Rule, RelayError> {
        self.admin.add_rule(rule).await
    }

    pub async fn update_rule(&self, rule: Rule) -> Result<Rule, RelayError> {
        self.admin.update_rule(rule).await
    }

    pub async fn set_rule_enabled(&self, id: RuleId, enabled: bool) -> Result<Rule, RelayError> {
        self.admin.set_rule_enabled(id, enabled).await
    }

    pub async fn retry(&self, id: &PostId) -> Result<Post, RelayError> {
        let post = self.admin.retry(id).await?;
        self.wake.notify_one();
        Ok(post)
    }

    /// Run one housekeeping pass now instead of waiting for the sweep interval.
    pub async fn sweep(&self) -> SweepReport {
        Sweeper {
            lifecycle: Arc::clone(&self.admin.lifecycle),
            gateway: Arc::clone(&self.gateway),
            dedup: Arc::clone(&self.admin.dedup),
            registry: self.admin.registry.clone(),
            config: self.admin.config.lifecycle.clone(),
        }
        .sweep()
        .await
    }
}

/// Open the SQLite database named in `config`, creating its directory when needed.
pub async fn open_stores(config: &RelayConfig) -> Result<RelayStores, RelayError> {
    let store = SqliteStore::open(&config.database_path).await?;
    Ok(RelayStores::sqlite(store))
}
