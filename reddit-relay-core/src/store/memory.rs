use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::contract::{DedupStore, PostStore, RuleStore, StateCount};
use crate::error::{DedupUnavailable, StoreError};
use crate::model::{NewRule, Post, PostId, PostState, Rule, RuleId};

/// Process-local store. Nothing survives a restart; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    dedup: DashMap<(RuleId, String), DateTime<Utc>>,
    posts: DashMap<PostId, Post>,
    rules: DashMap<RuleId, Rule>,
    next_rule_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn is_new(
        &self,
        rule: RuleId,
        item_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, DedupUnavailable> {
        match self.dedup.entry((rule, item_id.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(seen_at);
                Ok(true)
            }
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DedupUnavailable> {
        let before = self.dedup.len();
        self.dedup.retain(|_, first_seen| *first_seen >= cutoff);
        Ok(before.saturating_sub(self.dedup.len()) as u64)
    }

    async fn clear(&self) -> Result<u64, DedupUnavailable> {
        let removed = self.dedup.len() as u64;
        self.dedup.clear();
        Ok(removed)
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn insert(&self, post: &Post) -> Result<(), StoreError> {
        match self.posts.entry(post.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(post.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(post.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &PostId) -> Result<Option<Post>, StoreError> {
        Ok(self.posts.get(id).map(|p| p.value().clone()))
    }

    async fn replace(&self, post: &Post, expected: PostState) -> Result<bool, StoreError> {
        let Some(mut current) = self.posts.get_mut(&post.id) else {
            return Ok(false);
        };
        if current.state != expected {
            return Ok(false);
        }
        *current = post.clone();
        Ok(true)
    }

    async fn list_in_state(&self, state: PostState) -> Result<Vec<Post>, StoreError> {
        let mut posts: Vec<Post> = self
            .posts
            .iter()
            .filter(|p| p.state == state)
            .map(|p| p.value().clone())
            .collect();
        posts.sort_by_key(|p| p.updated_at);
        Ok(posts)
    }

    async fn count_in_state(&self, rule: RuleId, state: PostState) -> Result<u64, StoreError> {
        Ok(self
            .posts
            .iter()
            .filter(|p| p.rule_id == rule && p.state == state)
            .count() as u64)
    }

    async fn counts(&self) -> Result<Vec<StateCount>, StoreError> {
        let mut grouped: HashMap<(RuleId, PostState), u64> = HashMap::new();
        for post in self.posts.iter() {
            *grouped.entry((post.rule_id, post.state)).or_default() += 1;
        }
        Ok(grouped
            .into_iter()
            .map(|((rule_id, state), count)| StateCount { rule_id, state, count })
            .collect())
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let removed = self.posts.len() as u64;
        self.posts.clear();
        Ok(removed)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn create_rule(&self, rule: &NewRule, created_at: DateTime<Utc>) -> Result<Rule, StoreError> {
        let id = self.next_rule_id.fetch_add(1, Ordering::SeqCst) + 1;
        let rule = Rule {
            id,
            subreddit: rule.subreddit.clone(),
            sort: rule.sort,
            time_filter: rule.time_filter,
            poll_interval: rule.poll_interval,
            max_items: rule.max_items,
            channel: rule.channel.clone(),
            owner: rule.owner,
            enabled: true,
            last_checked_at: None,
            created_at,
        };
        self.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        self.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let mut rules: Vec<Rule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }
}
