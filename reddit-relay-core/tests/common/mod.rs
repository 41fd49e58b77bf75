#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use reddit_relay_core::contract::{AdminNotifier, ApprovalTicket, Destination, MediaPreparer, Preview, SourceClient};
use reddit_relay_core::error::{DeliveryError, FetchError, NotifyError, PipelineError};
use reddit_relay_core::model::{
    AdminId, AssetKind, MediaType, NewRule, Post, PostId, PostMetadata, PreparedAsset, Rule, SortMode,
    SourceItem, TimeFilter,
};

/// Owner of every rule built here.
pub const ADMIN: AdminId = 42;

pub fn rule(id: i64) -> Rule {
    Rule {
        id,
        subreddit: "pics".to_string(),
        sort: SortMode::Hot,
        time_filter: TimeFilter::Day,
        poll_interval: Duration::from_secs(300),
        max_items: 10,
        channel: "@relay_out".to_string(),
        owner: ADMIN,
        enabled: true,
        last_checked_at: None,
        created_at: Utc::now(),
    }
}

pub fn new_rule(subreddit: &str, poll_interval: Duration) -> NewRule {
    NewRule {
        subreddit: subreddit.to_string(),
        sort: SortMode::New,
        time_filter: TimeFilter::Day,
        poll_interval,
        max_items: 10,
        channel: "@relay_out".to_string(),
        owner: ADMIN,
    }
}

pub fn item(id: &str, media_type: MediaType) -> SourceItem {
    SourceItem {
        id: id.to_string(),
        media_type,
        media_urls: vec![format!("https://i.redd.it/{id}.jpg")],
        metadata: PostMetadata {
            title: format!("Post {id}"),
            author: "someone".to_string(),
            subreddit: "pics".to_string(),
            permalink: format!("/r/pics/comments/{id}/"),
            score: 10,
            created_at: None,
        },
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Returns the same listing on every fetch, counts calls and tracks how many fetches overlap.
pub struct FixedSource {
    pub items: Vec<SourceItem>,
    pub calls: AtomicUsize,
    pub fail: bool,
    pub delay: Duration,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl FixedSource {
    pub fn new(items: Vec<SourceItem>) -> Self {
        FixedSource {
            items,
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        FixedSource {
            fail: true,
            ..FixedSource::new(Vec::new())
        }
    }

    /// Every fetch takes `delay` before answering.
    pub fn slow(items: Vec<SourceItem>, delay: Duration) -> Self {
        FixedSource {
            delay,
            ..FixedSource::new(items)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for FixedSource {
    async fn fetch_candidates(&self, _rule: &Rule) -> Result<Vec<SourceItem>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(FetchError::Unreachable("connection refused".to_string()));
        }
        Ok(self.items.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub presented: Mutex<Vec<PostId>>,
    pub messages: Mutex<Vec<(AdminId, String)>>,
}

impl RecordingNotifier {
    pub fn presented(&self) -> Vec<PostId> {
        self.presented.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl AdminNotifier for RecordingNotifier {
    async fn present_for_approval(
        &self,
        _admin: AdminId,
        post: &Post,
        _preview: &Preview,
    ) -> Result<ApprovalTicket, NotifyError> {
        let mut presented = self.presented.lock().unwrap();
        presented.push(post.id.clone());
        Ok(ApprovalTicket(format!("msg-{}", presented.len())))
    }

    async fn notify(&self, admin: AdminId, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push((admin, message.to_string()));
        Ok(())
    }
}

/// Writes a placeholder file per post and tracks how many preparations overlap.
pub struct FakePreparer {
    pub assets_dir: PathBuf,
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl FakePreparer {
    pub fn new(assets_dir: PathBuf, delay: Duration) -> Self {
        FakePreparer {
            assets_dir,
            delay,
            fail: false,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaPreparer for FakePreparer {
    async fn prepare(&self, post: &Post) -> Result<PreparedAsset, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(PipelineError::EncodeFailed {
                attempts: 2,
                reason: "encoder crashed".to_string(),
            });
        }
        let root = self.assets_dir.join(post.id.as_str());
        tokio::fs::create_dir_all(&root).await?;
        let file = root.join("encoded.mp4");
        tokio::fs::write(&file, b"prepared").await?;
        Ok(PreparedAsset {
            kind: AssetKind::Video,
            root,
            files: vec![file],
        })
    }
}

#[derive(Default)]
pub struct RecordingDestination {
    pub delivered: Mutex<Vec<(String, PreparedAsset)>>,
    pub permanent_failure: bool,
}

impl RecordingDestination {
    pub fn delivered(&self) -> Vec<(String, PreparedAsset)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Destination for RecordingDestination {
    async fn deliver(&self, channel: &str, asset: &PreparedAsset, _metadata: &PostMetadata) -> Result<(), DeliveryError> {
        if self.permanent_failure {
            return Err(DeliveryError::Permanent("bot is not an admin of the channel".to_string()));
        }
        self.delivered.lock().unwrap().push((channel.to_string(), asset.clone()));
        Ok(())
    }
}
