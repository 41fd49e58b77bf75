//! Per-rule polling loops.
//!
//! Every enabled rule gets its own task that sleeps until the rule is due, runs one
//! cycle and sleeps again. Rules never share a timer, so a slow subreddit cannot delay
//! another rule's schedule; they only share the cycle permits that cap how many cycles
//! run at once.
//!
//! The supervisor reconciles the set of running loops with the registry whenever a rule
//! changes. Disabling a rule cancels its loop between cycles. A cycle that already
//! started is allowed to finish, and so is every in-flight cycle on shutdown. A rule
//! re-enabled while its old loop is still winding down gets a new loop only once the
//! old one has exited, so one rule never runs two cycles at once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::contract::AdminNotifier;
use crate::cycle::{CycleReport, CycleRunner};
use crate::error::CycleError;
use crate::model::{Rule, RuleId};
use crate::registry::RuleRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Failure streaks per rule. In memory only; a restart gives every rule a clean slate.
#[derive(Debug, Default)]
pub struct HealthBook {
    rules: Mutex<HashMap<RuleId, RuleHealth>>,
}

impl HealthBook {
    pub fn get(&self, id: RuleId) -> RuleHealth {
        self.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Returns true when this success ends a degraded period.
    pub fn record_success(&self, id: RuleId, at: DateTime<Utc>) -> bool {
        let mut rules = self.lock();
        let health = rules.entry(id).or_default();
        let recovered = health.degraded;
        health.consecutive_failures = 0;
        health.degraded = false;
        health.last_success_at = Some(at);
        recovered
    }

    /// Returns true when this failure is the one that crosses `threshold`.
    pub fn record_failure(&self, id: RuleId, detail: String, threshold: u32) -> bool {
        let mut rules = self.lock();
        let health = rules.entry(id).or_default();
        health.consecutive_failures += 1;
        health.last_error = Some(detail);
        if !health.degraded && health.consecutive_failures >= threshold.max(1) {
            health.degraded = true;
            return true;
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RuleId, RuleHealth>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rule loops the supervisor knows about, keyed by rule and tagged with a generation.
#[derive(Default)]
struct LoopBook {
    running: HashMap<RuleId, (u64, CancellationToken)>,
    // Cancelled loops that have not exited yet.
    stopping: HashMap<RuleId, u64>,
    generation: u64,
}

impl LoopBook {
    fn finished(&mut self, id: RuleId, generation: u64) {
        if self.running.get(&id).is_some_and(|(current, _)| *current == generation) {
            self.running.remove(&id);
        }
        if self.stopping.get(&id) == Some(&generation) {
            self.stopping.remove(&id);
        }
    }
}

pub struct Scheduler {
    registry: RuleRegistry,
    cycle: Arc<CycleRunner>,
    notifier: Arc<dyn AdminNotifier>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    health: Arc<HealthBook>,
}

impl Scheduler {
    pub fn new(
        registry: RuleRegistry,
        cycle: Arc<CycleRunner>,
        notifier: Arc<dyn AdminNotifier>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_cycles.max(1)));
        Scheduler {
            registry,
            cycle,
            notifier,
            config,
            permits,
            health: Arc::new(HealthBook::default()),
        }
    }

    pub fn health(&self) -> Arc<HealthBook> {
        Arc::clone(&self.health)
    }

    /// Supervise rule loops until `cancel` fires, then wait for every loop to wind down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.registry.subscribe();
        let mut loops: JoinSet<(RuleId, u64)> = JoinSet::new();
        let mut book = LoopBook::default();
        info!(max_concurrent_cycles = self.config.max_concurrent_cycles, "[SCHED] Scheduler started");

        loop {
            self.reconcile(&mut loops, &mut book, &cancel);
            tokio::select! {
                _ = cancel.cancelled() => break,
                Ok(()) = changes.changed() => {
                    debug!("[SCHED] Rule set changed");
                }
                Some(joined) = loops.join_next() => match joined {
                    Ok((id, finished)) => book.finished(id, finished),
                    Err(e) => error!(error = %e, "[SCHED] Rule loop panicked"),
                },
            }
        }

        info!(loops = loops.len(), "[SCHED] Shutting down, waiting for running cycles");
        while loops.join_next().await.is_some() {}
        info!("[SCHED] Scheduler stopped");
    }

    fn reconcile(self: &Arc<Self>, loops: &mut JoinSet<(RuleId, u64)>, book: &mut LoopBook, cancel: &CancellationToken) {
        let enabled: HashSet<RuleId> = self.registry.enabled_ids().into_iter().collect();

        let LoopBook { running, stopping, .. } = &mut *book;
        running.retain(|id, (generation, token)| {
            if enabled.contains(id) {
                return true;
            }
            info!(rule_id = *id, "[SCHED] Rule disabled or removed, stopping its loop");
            token.cancel();
            stopping.insert(*id, *generation);
            false
        });

        for id in enabled {
            if book.running.contains_key(&id) {
                continue;
            }
            if book.stopping.contains_key(&id) {
                debug!(rule_id = id, "[SCHED] Rule re-enabled, waiting for its previous loop to exit");
                continue;
            }
            book.generation += 1;
            let token = cancel.child_token();
            loops.spawn(Arc::clone(self).rule_loop(id, book.generation, token.clone()));
            book.running.insert(id, (book.generation, token));
            debug!(rule_id = id, "[SCHED] Rule loop spawned");
        }
    }

    async fn rule_loop(self: Arc<Self>, id: RuleId, generation: u64, cancel: CancellationToken) -> (RuleId, u64) {
        let mut changes = self.registry.subscribe();
        let mut last_started: Option<Instant> = None;

        loop {
            let Some(rule) = self.registry.get(id).filter(|r| r.enabled) else {
                break;
            };
            let due = due_at(&rule, last_started, Utc::now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                // Interval edits and history resets move the deadline.
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(due) => {}
            }

            let Some(rule) = self.registry.get(id).filter(|r| r.enabled) else {
                break;
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            last_started = Some(Instant::now());
            info!(rule_id = id, subreddit = %rule.subreddit, sort = rule.sort.as_str(), "[SCHED] Cycle starting");
            let outcome = self.cycle.run(&rule).await;
            drop(permit);
            // A failed check still counts as a check, so the rule waits a full interval.
            if let Err(e) = self.registry.record_checked(id, Utc::now()).await {
                warn!(rule_id = id, error = %e, "[SCHED] Could not record check time");
            }
            self.record_outcome(&rule, outcome).await;
        }

        debug!(rule_id = id, "[SCHED] Rule loop finished");
        (id, generation)
    }

    async fn record_outcome(&self, rule: &Rule, outcome: Result<CycleReport, CycleError>) {
        match outcome {
            Ok(_) => {
                if self.health.record_success(rule.id, Utc::now()) {
                    info!(rule_id = rule.id, "[SCHED] Rule recovered");
                    let message = format!("Rule #{} (r/{}) is healthy again.", rule.id, rule.subreddit);
                    self.notify(rule, &message).await;
                }
            }
            Err(e) => {
                let detail = format!("{}: {e}", e.kind());
                error!(rule_id = rule.id, subreddit = %rule.subreddit, kind = e.kind(), error = %e, "[SCHED] Cycle failed");
                let threshold = self.config.degraded_after_failures;
                if self.health.record_failure(rule.id, detail.clone(), threshold) {
                    warn!(rule_id = rule.id, failures = threshold, "[SCHED] Rule marked degraded");
                    let message = format!(
                        "Rule #{} (r/{}) is degraded after {} consecutive failed cycles.\nLast error: {}",
                        rule.id, rule.subreddit, threshold, detail
                    );
                    self.notify(rule, &message).await;
                }
            }
        }
    }

    async fn notify(&self, rule: &Rule, message: &str) {
        if let Err(e) = self.notifier.notify(rule.owner, message).await {
            warn!(rule_id = rule.id, admin = rule.owner, error = %e, "[SCHED] Could not notify admin");
        }
    }
}

/// When the next cycle of `rule` should start.
///
/// A rule that never ran, or whose history was cleared, is due immediately. After the
/// first cycle in this process the deadline counts from that cycle's start; before it,
/// from the persisted `last_checked_at`.
fn due_at(rule: &Rule, last_started: Option<Instant>, now: DateTime<Utc>) -> Instant {
    let Some(checked) = rule.last_checked_at else {
        return Instant::now();
    };
    if let Some(started) = last_started {
        return started + rule.poll_interval;
    }
    let elapsed = (now - checked).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + rule.poll_interval.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SortMode, TimeFilter};

    fn rule(last_checked_at: Option<DateTime<Utc>>) -> Rule {
        Rule {
            id: 1,
            subreddit: "rust".to_string(),
            sort: SortMode::Hot,
            time_filter: TimeFilter::Day,
            poll_interval: Duration::from_secs(300),
            max_items: 5,
            channel: "@relay".to_string(),
            owner: 7,
            enabled: true,
            last_checked_at,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_checked_rule_is_due_now() {
        let due = due_at(&rule(None), None, Utc::now());
        assert!(due <= Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_check_time_carries_over_restarts() {
        let now = Utc::now();
        let checked = now - chrono::Duration::seconds(120);
        let due = due_at(&rule(Some(checked)), None, now);
        assert_eq!(due - Instant::now(), Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_rule_fires_immediately() {
        let now = Utc::now();
        let checked = now - chrono::Duration::hours(3);
        let due = due_at(&rule(Some(checked)), None, now);
        assert!(due <= Instant::now());
    }

    #[test]
    fn cancelled_loop_is_remembered_until_it_exits() {
        let mut book = LoopBook::default();
        book.stopping.insert(1, 3);
        book.running.insert(2, (4, CancellationToken::new()));

        // A stale generation leaves both entries alone.
        book.finished(1, 2);
        book.finished(2, 1);
        assert!(book.stopping.contains_key(&1));
        assert!(book.running.contains_key(&2));

        book.finished(1, 3);
        book.finished(2, 4);
        assert!(book.stopping.is_empty());
        assert!(book.running.is_empty());
    }

    #[test]
    fn degraded_flag_set_once_and_cleared_by_success() {
        let book = HealthBook::default();
        assert!(!book.record_failure(1, "FetchError: down".into(), 3));
        assert!(!book.record_failure(1, "FetchError: down".into(), 3));
        assert!(book.record_failure(1, "FetchError: down".into(), 3));
        assert!(!book.record_failure(1, "FetchError: down".into(), 3));
        assert!(book.get(1).degraded);
        assert_eq!(book.get(1).consecutive_failures, 4);

        assert!(book.record_success(1, Utc::now()));
        let health = book.get(1);
        assert!(!health.degraded);
        assert_eq!(health.consecutive_failures, 0);
        assert!(!book.record_success(1, Utc::now()));
    }
}
