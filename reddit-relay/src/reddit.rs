//! Reddit source adapter.
//!
//! Uses application-only OAuth (`client_credentials`) against the public listing endpoints
//! and maps each submission to a [`SourceItem`]. The bearer token is cached until shortly
//! before it expires and dropped whenever Reddit answers 401.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use reddit_relay_core::contract::SourceClient;
use reddit_relay_core::error::FetchError;
use reddit_relay_core::model::{MediaType, PostMetadata, Rule, SortMode, SourceItem};

use crate::load_config::Secrets;

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_URL: &str = "https://oauth.reddit.com";
const TOKEN_MARGIN_SECS: u64 = 60;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "gif", "gifv"];
const IMAGE_HOSTS: &[&str] = &["i.redd.it", "i.imgur.com", "imgur.com"];
const VIDEO_HOSTS: &[&str] = &["v.redd.it", "redgifs.com"];

#[derive(Debug, Clone)]
pub struct RedditEndpoints {
    pub token_url: String,
    pub api_url: String,
}

impl Default for RedditEndpoints {
    fn default() -> Self {
        RedditEndpoints {
            token_url: TOKEN_URL.to_string(),
            api_url: API_URL.to_string(),
        }
    }
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct RedditClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    endpoints: RedditEndpoints,
    token: Mutex<Option<AccessToken>>,
}

impl RedditClient {
    pub fn new(secrets: &Secrets) -> anyhow::Result<Self> {
        Self::with_endpoints(secrets, RedditEndpoints::default())
    }

    pub fn with_endpoints(secrets: &Secrets, endpoints: RedditEndpoints) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(secrets.reddit_user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create Reddit HTTP client")?;
        Ok(RedditClient {
            http,
            client_id: secrets.reddit_client_id.clone(),
            client_secret: secrets.reddit_client_secret.clone(),
            endpoints,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.without_url().to_string()))?;
        let body: TokenResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let lifetime = body.expires_in.saturating_sub(TOKEN_MARGIN_SECS).max(1);
        info!(expires_in = body.expires_in, "Obtained Reddit access token");
        *cached = Some(AccessToken {
            value: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(body.access_token)
    }
}

#[async_trait]
impl SourceClient for RedditClient {
    async fn fetch_candidates(&self, rule: &Rule) -> Result<Vec<SourceItem>, FetchError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/r/{}/{}",
            self.endpoints.api_url.trim_end_matches('/'),
            rule.subreddit,
            rule.sort.as_str()
        );
        let mut query = vec![("limit", rule.max_items.to_string()), ("raw_json", "1".to_string())];
        if rule.sort == SortMode::Top {
            query.push(("t", rule.time_filter.as_str().to_string()));
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.without_url().to_string()))?;
        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, FetchError::Auth(_)) {
                    warn!(rule_id = rule.id, "Reddit rejected the cached token, dropping it");
                    self.token.lock().await.take();
                }
                return Err(e);
            }
        };
        let listing: Listing = response.json().await.map_err(|e| FetchError::Parse(e.to_string()))?;

        let items: Vec<SourceItem> = listing
            .data
            .children
            .into_iter()
            .take(rule.max_items as usize)
            .map(|child| into_source_item(child.data))
            .collect();
        debug!(rule_id = rule.id, subreddit = %rule.subreddit, items = items.len(), "Fetched Reddit listing");
        Ok(items)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(200).collect();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth(format!("{status}: {body}")),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
        _ => FetchError::Unreachable(format!("{status}: {body}")),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Deserialize)]
struct ListingChild {
    data: Submission,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Submission {
    id: String,
    title: String,
    author: String,
    subreddit: String,
    permalink: String,
    score: i64,
    created_utc: f64,
    url: String,
    url_overridden_by_dest: Option<String>,
    is_self: bool,
    is_video: bool,
    is_gallery: bool,
    media: Option<Media>,
    secure_media: Option<Media>,
    gallery_data: Option<GalleryData>,
    media_metadata: Option<HashMap<String, GalleryMedia>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Media {
    reddit_video: Option<RedditVideo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RedditVideo {
    fallback_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GalleryData {
    items: Vec<GalleryItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GalleryItem {
    media_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GalleryMedia {
    status: Option<String>,
    s: Option<GallerySource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GallerySource {
    u: Option<String>,
    gif: Option<String>,
}

impl Submission {
    fn link(&self) -> &str {
        self.url_overridden_by_dest.as_deref().unwrap_or(&self.url)
    }

    fn reddit_video_url(&self) -> Option<String> {
        [&self.secure_media, &self.media]
            .into_iter()
            .flatten()
            .filter_map(|m| m.reddit_video.as_ref())
            .find_map(|v| v.fallback_url.clone())
    }

    fn gallery_urls(&self) -> Vec<String> {
        let (Some(gallery), Some(metadata)) = (&self.gallery_data, &self.media_metadata) else {
            return Vec::new();
        };
        gallery
            .items
            .iter()
            .filter_map(|item| metadata.get(&item.media_id))
            .filter(|m| m.status.as_deref() != Some("failed"))
            .filter_map(|m| m.s.as_ref())
            .filter_map(|s| s.u.clone().or_else(|| s.gif.clone()))
            .map(|u| u.replace("&amp;", "&"))
            .collect()
    }
}

fn into_source_item(post: Submission) -> SourceItem {
    let (media_type, media_urls) = classify(&post);
    SourceItem {
        id: post.id,
        media_type,
        media_urls,
        metadata: PostMetadata {
            title: post.title,
            author: post.author,
            subreddit: post.subreddit,
            permalink: post.permalink,
            score: post.score,
            created_at: DateTime::from_timestamp(post.created_utc as i64, 0),
        },
    }
}

fn classify(post: &Submission) -> (MediaType, Vec<String>) {
    if post.is_gallery {
        let urls = post.gallery_urls();
        if !urls.is_empty() {
            return (MediaType::Gallery, urls);
        }
    }
    if let Some(video) = post.reddit_video_url() {
        return (MediaType::Video, vec![video]);
    }

    let link = post.link();
    if post.is_self || link.is_empty() {
        return (MediaType::Text, Vec::new());
    }
    let host = host_of(link);
    let ext = extension_of(link);

    if ext.as_deref().is_some_and(|e| VIDEO_EXTENSIONS.contains(&e)) {
        (MediaType::Video, vec![link.to_string()])
    } else if ext.as_deref().is_some_and(|e| IMAGE_EXTENSIONS.contains(&e)) {
        (MediaType::Image, vec![link.to_string()])
    } else if host_matches(&host, "v.redd.it") {
        // Bare v.redd.it links have no fallback; point at a common DASH rendition.
        (MediaType::Video, vec![format!("{}/DASH_720.mp4", link.trim_end_matches('/'))])
    } else if VIDEO_HOSTS.iter().any(|h| host_matches(&host, h)) {
        (MediaType::Video, vec![link.to_string()])
    } else if IMAGE_HOSTS.iter().any(|h| host_matches(&host, h)) {
        (MediaType::Image, vec![link.to_string()])
    } else {
        (MediaType::Text, Vec::new())
    }
}

fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    host.split(':').next().unwrap_or_default().to_ascii_lowercase()
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn extension_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = rest.split(['?', '#']).next()?;
    let (_, path) = path.split_once('/')?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(value: serde_json::Value) -> Submission {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn direct_links_are_classified_by_extension() {
        let image = submission(json!({"id": "a", "url": "https://i.redd.it/abc.PNG"}));
        assert_eq!(classify(&image), (MediaType::Image, vec!["https://i.redd.it/abc.PNG".to_string()]));

        let gif = submission(json!({"id": "b", "url": "https://i.imgur.com/xyz.gifv"}));
        assert_eq!(classify(&gif).0, MediaType::Video);

        let mp4 = submission(json!({"id": "c", "url": "https://example.com/clip.mp4?x=1"}));
        assert_eq!(classify(&mp4).0, MediaType::Video);
    }

    #[test]
    fn hosted_video_prefers_the_fallback_url() {
        let post = submission(json!({
            "id": "v1",
            "url": "https://v.redd.it/k3x9",
            "is_video": true,
            "media": {"reddit_video": {"fallback_url": "https://v.redd.it/k3x9/DASH_480.mp4?source=fallback"}},
        }));
        assert_eq!(
            classify(&post),
            (MediaType::Video, vec!["https://v.redd.it/k3x9/DASH_480.mp4?source=fallback".to_string()])
        );

        let bare = submission(json!({"id": "v2", "url": "https://v.redd.it/k3x9/", "media": null}));
        assert_eq!(classify(&bare).1, vec!["https://v.redd.it/k3x9/DASH_720.mp4".to_string()]);
    }

    #[test]
    fn galleries_keep_item_order_and_skip_failed_media() {
        let post = submission(json!({
            "id": "g1",
            "url": "https://www.reddit.com/gallery/g1",
            "is_gallery": true,
            "gallery_data": {"items": [{"media_id": "m2"}, {"media_id": "m1"}, {"media_id": "m3"}]},
            "media_metadata": {
                "m1": {"status": "valid", "s": {"u": "https://preview.redd.it/m1.jpg?width=10&amp;s=x"}},
                "m2": {"status": "valid", "s": {"u": "https://preview.redd.it/m2.jpg"}},
                "m3": {"status": "failed"},
            },
        }));
        assert_eq!(
            classify(&post),
            (
                MediaType::Gallery,
                vec![
                    "https://preview.redd.it/m2.jpg".to_string(),
                    "https://preview.redd.it/m1.jpg?width=10&s=x".to_string(),
                ]
            )
        );
    }

    #[test]
    fn self_posts_and_unknown_pages_are_text() {
        let selfpost = submission(json!({"id": "t", "url": "https://www.reddit.com/r/rust/comments/t/", "is_self": true}));
        assert_eq!(classify(&selfpost), (MediaType::Text, Vec::new()));

        let article = submission(json!({"id": "u", "url": "https://blog.rust-lang.org/2024/01/01/post.html"}));
        assert_eq!(classify(&article).0, MediaType::Text);

        let imgur = submission(json!({"id": "i", "url": "https://imgur.com/AbC123"}));
        assert_eq!(classify(&imgur).0, MediaType::Image);
    }

    #[test]
    fn metadata_is_carried_over() {
        let item = into_source_item(submission(json!({
            "id": "abc",
            "title": "A cat",
            "author": "someone",
            "subreddit": "pics",
            "permalink": "/r/pics/comments/abc/a_cat/",
            "score": 42,
            "created_utc": 1700000000.0,
            "url": "https://i.redd.it/abc.jpg",
        })));
        assert_eq!(item.id, "abc");
        assert_eq!(item.metadata.title, "A cat");
        assert_eq!(item.metadata.score, 42);
        assert_eq!(item.metadata.created_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn hosts_ignore_ports_and_subdomains() {
        assert_eq!(host_of("https://www.redgifs.com:443/watch/x"), "www.redgifs.com");
        assert!(host_matches("www.redgifs.com", "redgifs.com"));
        assert!(!host_matches("notimgur.com", "imgur.com"));
        assert_eq!(extension_of("https://imgur.com/AbC123"), None);
    }
}
