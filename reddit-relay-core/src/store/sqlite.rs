use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{error, info};

use super::{from_millis, to_millis};
use crate::contract::{DedupStore, PostStore, RuleStore, StateCount};
use crate::error::{DedupUnavailable, StoreError};
use crate::model::{
    Decision, MediaType, NewRule, Post, PostId, PostMetadata, PostState, PreparedAsset, Rule, RuleId,
    SortMode, TimeFilter,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subreddit TEXT NOT NULL,
        sort_mode TEXT NOT NULL,
        time_filter TEXT NOT NULL,
        poll_interval_secs INTEGER NOT NULL,
        max_items INTEGER NOT NULL,
        channel TEXT NOT NULL,
        owner INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_checked_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dedup_records (
        rule_id INTEGER NOT NULL,
        item_id TEXT NOT NULL,
        first_seen_at INTEGER NOT NULL,
        PRIMARY KEY (rule_id, item_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_dedup_first_seen ON dedup_records (first_seen_at)",
    "CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        rule_id INTEGER NOT NULL,
        source_item_id TEXT NOT NULL,
        media_type TEXT NOT NULL,
        media_urls TEXT NOT NULL,
        metadata TEXT NOT NULL,
        discovered_at INTEGER NOT NULL,
        state TEXT NOT NULL,
        decision TEXT,
        asset TEXT,
        error TEXT,
        pending_since INTEGER,
        approval_ticket TEXT,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_posts_state ON posts (state, rule_id)",
];

/// sqlite-backed store. One database file holds rules, dedup records and posts, so a
/// restart resumes exactly where the previous process stopped.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                error!(error = ?e, path = %parent.display(), "Failed to create database directory");
                StoreError::Backend(e.to_string())
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = SqliteStore { pool };
        store.migrate().await?;
        info!(path = %path.display(), "Opened sqlite store");
        Ok(store)
    }

    /// A private in-memory database. Limited to one connection, since every sqlite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = SqliteStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn corrupt(field: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{field}: {e}"))
}

fn opt_millis(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    row.try_get::<Option<i64>, _>(column)?
        .map(from_millis)
        .transpose()
}

fn post_from_row(row: &SqliteRow) -> Result<Post, StoreError> {
    let media_urls: String = row.try_get("media_urls")?;
    let metadata: String = row.try_get("metadata")?;
    let state: String = row.try_get("state")?;
    let media_type: String = row.try_get("media_type")?;
    let decision: Option<String> = row.try_get("decision")?;
    let asset: Option<String> = row.try_get("asset")?;

    Ok(Post {
        id: PostId::from(row.try_get::<String, _>("id")?),
        rule_id: row.try_get("rule_id")?,
        source_item_id: row.try_get("source_item_id")?,
        media_type: MediaType::from_str(&media_type).map_err(|e| corrupt("media_type", e))?,
        media_urls: serde_json::from_str(&media_urls).map_err(|e| corrupt("media_urls", e))?,
        metadata: serde_json::from_str::<PostMetadata>(&metadata).map_err(|e| corrupt("metadata", e))?,
        discovered_at: from_millis(row.try_get("discovered_at")?)?,
        state: PostState::from_str(&state).map_err(|e| corrupt("state", e))?,
        decision: match decision.as_deref() {
            None => None,
            Some("approved") => Some(Decision::Approved),
            Some("rejected") => Some(Decision::Rejected),
            Some(other) => return Err(corrupt("decision", other)),
        },
        asset: asset
            .map(|raw| serde_json::from_str::<PreparedAsset>(&raw))
            .transpose()
            .map_err(|e| corrupt("asset", e))?,
        error: row.try_get("error")?,
        pending_since: opt_millis(row, "pending_since")?,
        approval_ticket: row.try_get("approval_ticket")?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule, StoreError> {
    let sort: String = row.try_get("sort_mode")?;
    let time_filter: String = row.try_get("time_filter")?;
    let interval: i64 = row.try_get("poll_interval_secs")?;
    let max_items: i64 = row.try_get("max_items")?;
    Ok(Rule {
        id: row.try_get("id")?,
        subreddit: row.try_get("subreddit")?,
        sort: SortMode::from_str(&sort).map_err(|e| corrupt("sort_mode", e))?,
        time_filter: TimeFilter::from_str(&time_filter).map_err(|e| corrupt("time_filter", e))?,
        poll_interval: Duration::from_secs(u64::try_from(interval).map_err(|e| corrupt("poll_interval_secs", e))?),
        max_items: u32::try_from(max_items).map_err(|e| corrupt("max_items", e))?,
        channel: row.try_get("channel")?,
        owner: row.try_get("owner")?,
        enabled: row.try_get("enabled")?,
        last_checked_at: opt_millis(row, "last_checked_at")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

struct EncodedPost {
    media_urls: String,
    metadata: String,
    asset: Option<String>,
}

fn encode_post(post: &Post) -> Result<EncodedPost, StoreError> {
    let encode = |field: &str, e: serde_json::Error| StoreError::Backend(format!("encoding {field}: {e}"));
    Ok(EncodedPost {
        media_urls: serde_json::to_string(&post.media_urls).map_err(|e| encode("media_urls", e))?,
        metadata: serde_json::to_string(&post.metadata).map_err(|e| encode("metadata", e))?,
        asset: post
            .asset
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| encode("asset", e))?,
    })
}

#[async_trait]
impl DedupStore for SqliteStore {
    async fn is_new(
        &self,
        rule: RuleId,
        item_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, DedupUnavailable> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO dedup_records (rule_id, item_id, first_seen_at) VALUES (?, ?, ?)",
        )
        .bind(rule)
        .bind(item_id)
        .bind(to_millis(seen_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DedupUnavailable> {
        let result = sqlx::query("DELETE FROM dedup_records WHERE first_seen_at < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<u64, DedupUnavailable> {
        let result = sqlx::query("DELETE FROM dedup_records")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn insert(&self, post: &Post) -> Result<(), StoreError> {
        let encoded = encode_post(post)?;
        let result = sqlx::query(
            "INSERT INTO posts (id, rule_id, source_item_id, media_type, media_urls, metadata,
                discovered_at, state, decision, asset, error, pending_since, approval_ticket, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(post.id.as_str())
        .bind(post.rule_id)
        .bind(&post.source_item_id)
        .bind(post.media_type.as_str())
        .bind(&encoded.media_urls)
        .bind(&encoded.metadata)
        .bind(to_millis(post.discovered_at))
        .bind(post.state.as_str())
        .bind(post.decision.map(|d| d.as_str()))
        .bind(&encoded.asset)
        .bind(&post.error)
        .bind(post.pending_since.map(to_millis))
        .bind(&post.approval_ticket)
        .bind(to_millis(post.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(post.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &PostId) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn replace(&self, post: &Post, expected: PostState) -> Result<bool, StoreError> {
        let encoded = encode_post(post)?;
        let result = sqlx::query(
            "UPDATE posts SET state = ?, decision = ?, asset = ?, error = ?, pending_since = ?,
                approval_ticket = ?, media_urls = ?, metadata = ?, updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(post.state.as_str())
        .bind(post.decision.map(|d| d.as_str()))
        .bind(&encoded.asset)
        .bind(&post.error)
        .bind(post.pending_since.map(to_millis))
        .bind(&post.approval_ticket)
        .bind(&encoded.media_urls)
        .bind(&encoded.metadata)
        .bind(to_millis(post.updated_at))
        .bind(post.id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_in_state(&self, state: PostState) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query("SELECT * FROM posts WHERE state = ? ORDER BY updated_at ASC")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(post_from_row).collect()
    }

    async fn count_in_state(&self, rule: RuleId, state: PostState) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM posts WHERE rule_id = ? AND state = ?")
            .bind(rule)
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn counts(&self) -> Result<Vec<StateCount>, StoreError> {
        let rows = sqlx::query("SELECT rule_id, state, COUNT(*) AS n FROM posts GROUP BY rule_id, state")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                let n: i64 = row.try_get("n")?;
                Ok(StateCount {
                    rule_id: row.try_get("rule_id")?,
                    state: PostState::from_str(&state).map_err(|e| corrupt("state", e))?,
                    count: n as u64,
                })
            })
            .collect()
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM posts").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn create_rule(&self, rule: &NewRule, created_at: DateTime<Utc>) -> Result<Rule, StoreError> {
        let result = sqlx::query(
            "INSERT INTO rules (subreddit, sort_mode, time_filter, poll_interval_secs, max_items,
                channel, owner, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&rule.subreddit)
        .bind(rule.sort.as_str())
        .bind(rule.time_filter.as_str())
        .bind(rule.poll_interval.as_secs() as i64)
        .bind(i64::from(rule.max_items))
        .bind(&rule.channel)
        .bind(rule.owner)
        .bind(to_millis(created_at))
        .execute(&self.pool)
        .await?;

        Ok(Rule {
            id: result.last_insert_rowid(),
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
        })
    }

    async fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE rules SET subreddit = ?, sort_mode = ?, time_filter = ?, poll_interval_secs = ?,
                max_items = ?, channel = ?, owner = ?, enabled = ?, last_checked_at = ?
             WHERE id = ?",
        )
        .bind(&rule.subreddit)
        .bind(rule.sort.as_str())
        .bind(rule.time_filter.as_str())
        .bind(rule.poll_interval.as_secs() as i64)
        .bind(i64::from(rule.max_items))
        .bind(&rule.channel)
        .bind(rule.owner)
        .bind(rule.enabled)
        .bind(rule.last_checked_at.map(to_millis))
        .bind(rule.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rule_from_row).collect()
    }
}
