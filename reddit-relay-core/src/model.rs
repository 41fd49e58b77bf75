//! Plain data shared by every stage of the relay: rules, candidate items, posts and
//! the assets the media pipeline hands to delivery.
//!
//! Nothing in here performs I/O. Validation of admin-supplied rule fields lives on
//! [`NewRule`] so both the CLI and the runtime handle apply the same checks.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type RuleId = i64;
pub type AdminId = i64;

/// Serialize a `Duration` as whole seconds.
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Hot,
    New,
    Top,
    Rising,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::Hot => "hot",
            SortMode::New => "new",
            SortMode::Top => "top",
            SortMode::Rising => "rising",
        }
    }
}

impl FromStr for SortMode {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(SortMode::Hot),
            "new" => Ok(SortMode::New),
            "top" => Ok(SortMode::Top),
            "rising" => Ok(SortMode::Rising),
            other => Err(RuleError::UnknownSortMode(other.to_string())),
        }
    }
}

/// Time window for `top` listings. Ignored for the other sort modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

impl FromStr for TimeFilter {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(TimeFilter::Hour),
            "day" => Ok(TimeFilter::Day),
            "week" => Ok(TimeFilter::Week),
            "month" => Ok(TimeFilter::Month),
            "year" => Ok(TimeFilter::Year),
            "all" => Ok(TimeFilter::All),
            other => Err(RuleError::UnknownTimeFilter(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid subreddit name: {0:?}")]
    InvalidSubreddit(String),
    #[error("invalid destination channel {0:?}: expected @name or a numeric id")]
    InvalidChannel(String),
    #[error("poll interval must be greater than zero")]
    ZeroInterval,
    #[error("poll interval of {0}h is outside the allowed 1..=168 hours")]
    IntervalOutOfRange(u64),
    #[error("max items per cycle must be at least 1")]
    ZeroMaxItems,
    #[error("unknown sort mode {0:?}")]
    UnknownSortMode(String),
    #[error("unknown time filter {0:?}")]
    UnknownTimeFilter(String),
    #[error("rule {0} does not exist")]
    NotFound(RuleId),
}

/// A persistent binding of one subreddit to one destination channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub subreddit: String,
    pub sort: SortMode,
    pub time_filter: TimeFilter,
    #[serde(rename = "poll_interval_secs", with = "serde_secs")]
    pub poll_interval: Duration,
    pub max_items: u32,
    pub channel: String,
    pub owner: AdminId,
    pub enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.poll_interval.is_zero() {
            return Err(RuleError::ZeroInterval);
        }
        if self.max_items == 0 {
            return Err(RuleError::ZeroMaxItems);
        }
        Ok(())
    }
}

/// Fields an admin supplies when creating a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub subreddit: String,
    pub sort: SortMode,
    pub time_filter: TimeFilter,
    pub poll_interval: Duration,
    pub max_items: u32,
    pub channel: String,
    pub owner: AdminId,
}

pub const MIN_ADMIN_INTERVAL_HOURS: u64 = 1;
pub const MAX_ADMIN_INTERVAL_HOURS: u64 = 168;

impl NewRule {
    /// Normalise the subreddit name and check every field the core relies on.
    pub fn normalize(mut self) -> Result<Self, RuleError> {
        self.subreddit = normalize_subreddit(&self.subreddit)?;
        self.channel = normalize_channel(&self.channel)?;
        if self.poll_interval.is_zero() {
            return Err(RuleError::ZeroInterval);
        }
        if self.max_items == 0 {
            return Err(RuleError::ZeroMaxItems);
        }
        Ok(self)
    }

    /// Admin-facing rules poll between once an hour and once a week.
    pub fn check_admin_interval(&self) -> Result<(), RuleError> {
        let hours = self.poll_interval.as_secs() / 3600;
        let whole = self.poll_interval.as_secs() % 3600 == 0;
        if !whole || !(MIN_ADMIN_INTERVAL_HOURS..=MAX_ADMIN_INTERVAL_HOURS).contains(&hours) {
            return Err(RuleError::IntervalOutOfRange(hours));
        }
        Ok(())
    }
}

fn subreddit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{2,21}$").expect("static regex"))
}

/// Accepts `pics`, `r/pics`, `/r/pics/` and returns `pics`.
pub fn normalize_subreddit(raw: &str) -> Result<String, RuleError> {
    let trimmed = raw.trim().trim_matches('/');
    let name = trimmed
        .strip_prefix("r/")
        .or_else(|| trimmed.strip_prefix("R/"))
        .unwrap_or(trimmed)
        .trim_matches('/');
    if subreddit_pattern().is_match(name) {
        Ok(name.to_string())
    } else {
        Err(RuleError::InvalidSubreddit(raw.to_string()))
    }
}

/// Channels are either `@public_name` or a numeric chat id (negative for channels).
pub fn normalize_channel(raw: &str) -> Result<String, RuleError> {
    let channel = raw.trim();
    let valid = match channel.strip_prefix('@') {
        Some(name) => !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
        None => {
            let digits = channel.strip_prefix('-').unwrap_or(channel);
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
    };
    if valid {
        Ok(channel.to_string())
    } else {
        Err(RuleError::InvalidChannel(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Gallery,
    Text,
}

impl MediaType {
    /// Only media-bearing items enter the pipeline.
    pub fn is_media(&self) -> bool {
        !matches!(self, MediaType::Text)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Gallery => "gallery",
            MediaType::Text => "text",
        }
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "gallery" => Ok(MediaType::Gallery),
            "text" => Ok(MediaType::Text),
            other => Err(format!("unknown media type {other:?}")),
        }
    }
}

/// Descriptive fields carried from the source listing to the preview and the caption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostMetadata {
    pub title: String,
    pub author: String,
    pub subreddit: String,
    pub permalink: String,
    pub score: i64,
    pub created_at: Option<DateTime<Utc>>,
}

/// One candidate returned by the source collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    /// The source platform's permanent id for the item.
    pub id: String,
    pub media_type: MediaType,
    pub media_urls: Vec<String>,
    pub metadata: PostMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    /// Stable id for `item_id` as discovered by `rule`.
    pub fn fingerprint(rule: RuleId, item_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(rule.to_be_bytes());
        hasher.update(item_id.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        PostId(format!("{rule}-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PostId {
    fn from(value: String) -> Self {
        PostId(value)
    }
}

impl From<&str> for PostId {
    fn from(value: &str) -> Self {
        PostId(value.to_string())
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PostState {
    Discovered,
    PendingApproval,
    Approved,
    Rejected,
    Expired,
    Processing,
    ReadyToForward,
    ProcessingFailed,
    Forwarded,
    DeliveryFailed,
}

impl PostState {
    pub const ALL: [PostState; 10] = [
        PostState::Discovered,
        PostState::PendingApproval,
        PostState::Approved,
        PostState::Rejected,
        PostState::Expired,
        PostState::Processing,
        PostState::ReadyToForward,
        PostState::ProcessingFailed,
        PostState::Forwarded,
        PostState::DeliveryFailed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostState::Rejected
                | PostState::Expired
                | PostState::ProcessingFailed
                | PostState::Forwarded
                | PostState::DeliveryFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PostState::Discovered => "discovered",
            PostState::PendingApproval => "pending_approval",
            PostState::Approved => "approved",
            PostState::Rejected => "rejected",
            PostState::Expired => "expired",
            PostState::Processing => "processing",
            PostState::ReadyToForward => "ready_to_forward",
            PostState::ProcessingFailed => "processing_failed",
            PostState::Forwarded => "forwarded",
            PostState::DeliveryFailed => "delivery_failed",
        }
    }
}

impl FromStr for PostState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PostState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown post state {s:?}"))
    }
}

impl fmt::Display for PostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Photo,
    Video,
    Album,
}

/// A delivery-ready asset. `root` is owned by the post and removed once it is forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedAsset {
    pub kind: AssetKind,
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

/// One discovered candidate tracked through the lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub rule_id: RuleId,
    pub source_item_id: String,
    pub media_type: MediaType,
    pub media_urls: Vec<String>,
    pub metadata: PostMetadata,
    pub discovered_at: DateTime<Utc>,
    pub state: PostState,
    pub decision: Option<Decision>,
    pub asset: Option<PreparedAsset>,
    pub error: Option<String>,
    pub pending_since: Option<DateTime<Utc>>,
    pub approval_ticket: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn discovered(rule_id: RuleId, item: SourceItem, now: DateTime<Utc>) -> Self {
        Post {
            id: PostId::fingerprint(rule_id, &item.id),
            rule_id,
            source_item_id: item.id,
            media_type: item.media_type,
            media_urls: item.media_urls,
            metadata: item.metadata,
            discovered_at: now,
            state: PostState::Discovered,
            decision: None,
            asset: None,
            error: None,
            pending_since: None,
            approval_ticket: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subreddit_names_are_cleaned() {
        struct TestCase {
            raw: &'static str,
            expected: Option<&'static str>,
        }
        let cases = vec![
            TestCase { raw: "pics", expected: Some("pics") },
            TestCase { raw: "r/pics", expected: Some("pics") },
            TestCase { raw: "/r/aww/", expected: Some("aww") },
            TestCase { raw: "  rust_gamedev ", expected: Some("rust_gamedev") },
            TestCase { raw: "a", expected: None },
            TestCase { raw: "bad name", expected: None },
        ];
        for case in cases {
            let got = normalize_subreddit(case.raw).ok();
            assert_eq!(got.as_deref(), case.expected, "input {:?}", case.raw);
        }
    }

    #[test]
    fn channels_accept_handles_and_numeric_ids() {
        assert_eq!(normalize_channel("@my_channel").unwrap(), "@my_channel");
        assert_eq!(normalize_channel("-1001234567890").unwrap(), "-1001234567890");
        assert!(normalize_channel("my_channel").is_err());
        assert!(normalize_channel("@").is_err());
    }

    #[test]
    fn admin_interval_bounds() {
        let mut rule = NewRule {
            subreddit: "pics".into(),
            sort: SortMode::Hot,
            time_filter: TimeFilter::Day,
            poll_interval: Duration::from_secs(3600),
            max_items: 10,
            channel: "@c".into(),
            owner: 1,
        };
        assert!(rule.check_admin_interval().is_ok());
        rule.poll_interval = Duration::from_secs(169 * 3600);
        assert_eq!(rule.check_admin_interval(), Err(RuleError::IntervalOutOfRange(169)));
        rule.poll_interval = Duration::from_secs(90);
        assert!(rule.check_admin_interval().is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_rule_scoped() {
        let a = PostId::fingerprint(1, "abc123");
        assert_eq!(a, PostId::fingerprint(1, "abc123"));
        assert_ne!(a, PostId::fingerprint(2, "abc123"));
        assert!(a.as_str().starts_with("1-"));
    }

    #[test]
    fn post_state_names_round_trip_through_storage_form() {
        for state in PostState::ALL {
            assert_eq!(state.as_str().parse::<PostState>().unwrap(), state);
        }
    }
}
