//! Live rule set shared by the scheduler, the gateway and the dispatcher.
//!
//! The registry is a cheap cloneable handle. Every edit is written to the [`RuleStore`]
//! first and then swapped into memory under a short write lock. Subscribers are told
//! through a `watch` channel, and the scheduler re-reads a rule on every tick instead
//! of holding a copy.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::contract::RuleStore;
use crate::error::StoreError;
use crate::model::{NewRule, Rule, RuleError, RuleId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] RuleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct RuleRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    rules: RwLock<HashMap<RuleId, Rule>>,
    store: Arc<dyn RuleStore>,
    changes: watch::Sender<u64>,
    // Held across every memory-then-store write so the two never disagree.
    persist: Mutex<()>,
}

impl RuleRegistry {
    pub async fn load(store: Arc<dyn RuleStore>) -> Result<Self, StoreError> {
        let rules = store.load_rules().await?;
        info!(rules = rules.len(), "[RELAY] Loaded rule registry");
        let (changes, _) = watch::channel(0);
        Ok(RuleRegistry {
            inner: Arc::new(Inner {
                rules: RwLock::new(rules.into_iter().map(|r| (r.id, r)).collect()),
                store,
                changes,
                persist: Mutex::new(()),
            }),
        })
    }

    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.read().get(&id).cloned()
    }

    /// All rules, ordered by id.
    pub fn snapshot(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.read().values().cloned().collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    pub fn enabled_ids(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.read().values().filter(|r| r.enabled).map(|r| r.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub async fn add(&self, rule: NewRule) -> Result<Rule, RegistryError> {
        let rule = rule.normalize()?;
        let _held = self.inner.persist.lock().await;
        let created = self.inner.store.create_rule(&rule, Utc::now()).await?;
        info!(rule_id = created.id, subreddit = %created.subreddit, channel = %created.channel, "[RELAY] Rule added");
        self.put(created.clone());
        Ok(created)
    }

    /// Replace an existing rule's settings. Sort mode and interval changes apply from the
    /// next cycle. Bookkeeping fields (`last_checked_at`, `created_at`) are kept.
    pub async fn update(&self, rule: Rule) -> Result<Rule, RegistryError> {
        rule.validate()?;
        let _held = self.inner.persist.lock().await;
        let current = self.get(rule.id).ok_or(RuleError::NotFound(rule.id))?;
        let rule = Rule {
            last_checked_at: current.last_checked_at,
            created_at: current.created_at,
            ..rule
        };
        self.inner.store.save_rule(&rule).await?;
        info!(rule_id = rule.id, enabled = rule.enabled, "[RELAY] Rule updated");
        self.put(rule.clone());
        Ok(rule)
    }

    /// Soft enable/disable. Disabled rules keep their history.
    pub async fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<Rule, RegistryError> {
        let mut rule = self.get(id).ok_or(RuleError::NotFound(id))?;
        rule.enabled = enabled;
        self.update(rule).await
    }

    pub async fn record_checked(&self, id: RuleId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let _held = self.inner.persist.lock().await;
        let updated = {
            let mut rules = self.write();
            match rules.get_mut(&id) {
                Some(rule) => {
                    rule.last_checked_at = Some(at);
                    rule.clone()
                }
                None => return Ok(()),
            }
        };
        self.inner.store.save_rule(&updated).await
    }

    /// Forget when each rule last ran, so every rule fires on the next scheduler pass.
    pub async fn reset_checked(&self) -> Result<(), StoreError> {
        let _held = self.inner.persist.lock().await;
        let rules: Vec<Rule> = {
            let mut rules = self.write();
            rules
                .values_mut()
                .map(|rule| {
                    rule.last_checked_at = None;
                    rule.clone()
                })
                .collect()
        };
        for rule in &rules {
            self.inner.store.save_rule(rule).await?;
        }
        self.notify();
        Ok(())
    }

    /// Pick up edits written to the store by another process.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let _held = self.inner.persist.lock().await;
        let stored = self.inner.store.load_rules().await?;
        let changed = {
            let mut rules = self.write();
            let mut changed = stored.len() != rules.len();
            for rule in stored {
                let differs = rules
                    .get(&rule.id)
                    .map_or(true, |current| !same_config(current, &rule));
                if differs {
                    changed = true;
                    rules.insert(rule.id, rule);
                }
            }
            changed
        };
        if changed {
            info!("[RELAY] Rule registry reloaded with external changes");
            self.notify();
        }
        Ok(())
    }

    fn put(&self, rule: Rule) {
        self.write().insert(rule.id, rule);
        self.notify();
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RuleId, Rule>> {
        self.inner.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RuleId, Rule>> {
        self.inner.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_config(a: &Rule, b: &Rule) -> bool {
    a.subreddit == b.subreddit
        && a.sort == b.sort
        && a.time_filter == b.time_filter
        && a.poll_interval == b.poll_interval
        && a.max_items == b.max_items
        && a.channel == b.channel
        && a.owner == b.owner
        && a.enabled == b.enabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SortMode, TimeFilter};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn new_rule(subreddit: &str) -> NewRule {
        NewRule {
            subreddit: subreddit.to_string(),
            sort: SortMode::Hot,
            time_filter: TimeFilter::Day,
            poll_interval: Duration::from_secs(3600),
            max_items: 5,
            channel: "@out".to_string(),
            owner: 1,
        }
    }

    #[tokio::test]
    async fn add_normalises_and_rejects_bad_names() {
        let registry = RuleRegistry::load(Arc::new(MemoryStore::new())).await.unwrap();
        let rule = registry.add(new_rule("/r/rust/")).await.unwrap();
        assert_eq!(rule.subreddit, "rust");
        assert!(matches!(
            registry.add(new_rule("no spaces")).await,
            Err(RegistryError::Invalid(RuleError::InvalidSubreddit(_)))
        ));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn update_keeps_bookkeeping_and_notifies() {
        let registry = RuleRegistry::load(Arc::new(MemoryStore::new())).await.unwrap();
        let rule = registry.add(new_rule("rust")).await.unwrap();
        let checked = Utc::now();
        registry.record_checked(rule.id, checked).await.unwrap();

        let mut changes = registry.subscribe();
        let mut edited = rule.clone();
        edited.sort = SortMode::Top;
        edited.last_checked_at = None;
        let saved = registry.update(edited).await.unwrap();

        assert!(changes.has_changed().unwrap());
        assert_eq!(saved.sort, SortMode::Top);
        assert_eq!(saved.last_checked_at, Some(checked));
    }

    #[tokio::test]
    async fn disabled_rules_leave_the_enabled_set() {
        let registry = RuleRegistry::load(Arc::new(MemoryStore::new())).await.unwrap();
        let a = registry.add(new_rule("rust")).await.unwrap();
        let b = registry.add(new_rule("pics")).await.unwrap();
        registry.set_enabled(a.id, false).await.unwrap();
        assert_eq!(registry.enabled_ids(), vec![b.id]);
        assert!(registry.set_enabled(99, true).await.is_err());
    }

    #[tokio::test]
    async fn reload_picks_up_edits_from_another_process() {
        let store = Arc::new(MemoryStore::new());
        let registry = RuleRegistry::load(store.clone()).await.unwrap();
        let other = RuleRegistry::load(store).await.unwrap();

        let rule = other.add(new_rule("rust")).await.unwrap();
        assert!(registry.get(rule.id).is_none());

        registry.reload().await.unwrap();
        assert_eq!(registry.get(rule.id).unwrap().subreddit, "rust");
    }
}
