//! Download stage: fetches raw media streams into the job workspace.
//!
//! Reddit's media hosts reject requests that do not look like a browser, so every
//! request carries a browser user agent and asks for an uncompressed body. Each attempt
//! is bounded by the stage timeout; failed attempts are retried immediately up to the
//! configured count.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::model::MediaType;

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Streams smaller than this are treated as missing (Reddit serves tiny error bodies).
pub const MIN_STREAM_BYTES: u64 = 1024;

pub struct Downloader {
    client: reqwest::Client,
    timeout: Duration,
    attempts: u32,
}

impl Downloader {
    pub fn new(timeout: Duration, attempts: u32) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| PipelineError::DownloadFailed {
                attempts: 0,
                reason: format!("building http client: {e}"),
            })?;
        Ok(Downloader {
            client,
            timeout,
            attempts: attempts.max(1),
        })
    }

    /// Fetch `url` into `dir/<stem>.<ext>`, retrying on timeout or network error.
    pub async fn fetch(
        &self,
        url: &str,
        dir: &Path,
        stem: &str,
        min_bytes: u64,
    ) -> Result<PathBuf, PipelineError> {
        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, self.fetch_once(url, dir, stem, min_bytes)).await {
                Ok(Ok(path)) => {
                    info!(url, attempt, path = %path.display(), "[PIPELINE] Downloaded media stream");
                    return Ok(path);
                }
                Ok(Err(reason)) => last_error = reason,
                Err(_) => last_error = format!("timed out after {}s", self.timeout.as_secs_f32()),
            }
            warn!(url, attempt, error = %last_error, "[PIPELINE] Download attempt failed");
        }
        Err(PipelineError::DownloadFailed {
            attempts: self.attempts,
            reason: last_error,
        })
    }

    /// Try each candidate once and return the first usable stream. Used for optional
    /// audio tracks, where absence is normal.
    pub async fn fetch_first(&self, candidates: &[String], dir: &Path, stem: &str) -> Option<PathBuf> {
        for url in candidates {
            match tokio::time::timeout(self.timeout, self.fetch_once(url, dir, stem, MIN_STREAM_BYTES)).await {
                Ok(Ok(path)) => {
                    info!(url = %url, "[PIPELINE] Found separate audio stream");
                    return Some(path);
                }
                Ok(Err(reason)) => debug!(url = %url, reason = %reason, "Audio candidate unavailable"),
                Err(_) => debug!(url = %url, "Audio candidate timed out"),
            }
        }
        None
    }

    async fn fetch_once(&self, url: &str, dir: &Path, stem: &str, min_bytes: u64) -> Result<PathBuf, String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let path = dir.join(format!("{stem}.{}", extension_for(content_type.as_deref(), url)));

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| format!("creating {}: {e}", path.display()))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| format!("reading body: {e}"))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("writing {}: {e}", path.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| format!("flushing {}: {e}", path.display()))?;

        if written < min_bytes {
            // Leave nothing behind for the next attempt to trip over.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(format!("body too small ({written} bytes)"));
        }
        Ok(path)
    }
}

fn extension_for(content_type: Option<&str>, url: &str) -> String {
    let from_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .and_then(|ct| match ct.as_str() {
            "image/jpeg" | "image/jpg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/webp" => Some("webp"),
            "image/gif" => Some("gif"),
            "video/mp4" => Some("mp4"),
            "video/webm" => Some("webm"),
            "video/quicktime" => Some("mov"),
            "audio/mp4" => Some("m4a"),
            _ => None,
        });
    if let Some(ext) = from_type {
        return ext.to_string();
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

fn imgur_page() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.|m\.)?imgur\.com/([A-Za-z0-9]+)/?$").expect("static regex")
    })
}

fn dash_stream() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(https?://v\.redd\.it/[^/]+)/(?:DASH_[^/?]+|HLSPlaylist[^/?]*)").expect("static regex")
    })
}

/// Rewrite page links to direct media links where the host has a known pattern.
pub fn resolve_media_url(url: &str, media_type: MediaType) -> String {
    if let Some(caps) = imgur_page().captures(url) {
        let ext = if media_type == MediaType::Video { "mp4" } else { "jpg" };
        return format!("https://i.imgur.com/{}.{ext}", &caps[1]);
    }
    if let Some(stripped) = url.strip_suffix(".gifv") {
        return format!("{stripped}.mp4");
    }
    url.to_string()
}

/// Separate audio track candidates for a `v.redd.it` DASH video, in preference order.
pub fn dash_audio_candidates(video_url: &str) -> Vec<String> {
    let Some(caps) = dash_stream().captures(video_url) else {
        return Vec::new();
    };
    let base = &caps[1];
    ["DASH_AUDIO_128.mp4", "DASH_audio.mp4", "audio"]
        .iter()
        .map(|name| format!("{base}/{name}"))
        .collect()
}
