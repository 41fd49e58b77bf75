//! Telegram Bot API adapter: the relay's delivery [`Destination`] and its [`AdminNotifier`].
//!
//! Approval requests are plain messages with an inline keyboard whose buttons carry
//! `approve:<post_id>` or `reject:<post_id>`. [`TelegramClient::poll_decisions`] long-polls
//! `getUpdates` and turns those button presses into [`DecisionMessage`]s tagged with the
//! presser's user id. Whether that user may decide is up to the approval gateway, which
//! reports refusals back through [`AdminNotifier::notify`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reddit_relay_core::approval::DecisionMessage;
use reddit_relay_core::contract::{AdminNotifier, ApprovalTicket, Destination, Preview};
use reddit_relay_core::error::{DeliveryError, NotifyError};
use reddit_relay_core::model::{AdminId, AssetKind, Decision, Post, PostId, PostMetadata, PreparedAsset};

const API_BASE: &str = "https://api.telegram.org";
const CAPTION_LIMIT: usize = 1024;
const MESSAGE_LIMIT: usize = 4096;
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum ApiError {
    #[error("telegram unreachable: {0}")]
    Transport(String),
    #[error("telegram error {code}: {description}")]
    Rejected { code: u16, description: String },
    #[error("unexpected telegram response: {0}")]
    Malformed(String),
}

impl ApiError {
    fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Rejected { code, .. } => *code == 429 || *code >= 500,
            ApiError::Malformed(_) => false,
        }
    }
}

impl From<ApiError> for DeliveryError {
    fn from(e: ApiError) -> Self {
        if e.is_transient() {
            DeliveryError::Transient(e.to_string())
        } else {
            DeliveryError::Permanent(e.to_string())
        }
    }
}

impl From<ApiError> for NotifyError {
    fn from(e: ApiError) -> Self {
        NotifyError(e.to_string())
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Deserialize)]
struct Message {
    message_id: i64,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    id: String,
    from: CallbackUser,
    data: Option<String>,
    message: Option<CallbackMessage>,
}

#[derive(Deserialize)]
struct CallbackUser {
    id: i64,
}

#[derive(Deserialize)]
struct CallbackMessage {
    message_id: i64,
    chat: Chat,
}

#[derive(Deserialize)]
struct Chat {
    id: i64,
}

pub struct TelegramClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> anyhow::Result<Self> {
        Self::with_base_url(token, API_BASE)
    }

    pub fn with_base_url(token: &str, base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create Telegram HTTP client")?;
        Ok(TelegramClient {
            http,
            endpoint: format!("{}/bot{token}", base.trim_end_matches('/')),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.endpoint)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, ApiError> {
        let response = self
            .http
            .post(self.url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.without_url().to_string()))?;
        read_envelope(response).await
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T, ApiError> {
        let response = self
            .http
            .post(self.url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.without_url().to_string()))?;
        read_envelope(response).await
    }

    async fn send_file(
        &self,
        method: &str,
        field: &'static str,
        channel: &str,
        caption: &str,
        path: &Path,
    ) -> Result<(), DeliveryError> {
        let mut form = Form::new()
            .text("chat_id", channel.to_string())
            .text("caption", caption.to_string())
            .part(field, file_part(path).await?);
        if field == "video" {
            form = form.text("supports_streaming", "true");
        }
        self.call_multipart::<Message>(method, form).await?;
        Ok(())
    }

    async fn send_album(&self, channel: &str, caption: &str, files: &[PathBuf]) -> Result<(), DeliveryError> {
        let mut form = Form::new().text("chat_id", channel.to_string());
        let mut media = Vec::with_capacity(files.len());
        for (i, path) in files.iter().enumerate() {
            let name = format!("file{i}");
            let mut entry = json!({ "type": "photo", "media": format!("attach://{name}") });
            if i == 0 {
                entry["caption"] = json!(caption);
            }
            media.push(entry);
            form = form.part(name, file_part(path).await?);
        }
        form = form.text("media", Value::Array(media).to_string());
        self.call_multipart::<Vec<Message>>("sendMediaGroup", form).await?;
        Ok(())
    }

    /// Long-poll for approve/reject button presses until `cancel` fires or the decision
    /// channel closes.
    pub async fn poll_decisions(&self, decisions: mpsc::Sender<DecisionMessage>, cancel: CancellationToken) {
        let mut offset: i64 = 0;
        info!("[APPROVAL] Listening for decisions from Telegram");
        loop {
            let body = json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["callback_query"],
            });
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.call::<Vec<Update>>("getUpdates", &body) => polled,
            };
            let updates = match polled {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "[APPROVAL] getUpdates failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_BACKOFF) => continue,
                    }
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(query) = update.callback_query else {
                    continue;
                };
                if !self.handle_callback(query, &decisions).await {
                    info!("[APPROVAL] Decision channel closed, stopping Telegram poller");
                    return;
                }
            }
        }
        info!("[APPROVAL] Telegram poller stopped");
    }

    /// Returns false once the decision channel is closed.
    async fn handle_callback(&self, query: CallbackQuery, decisions: &mpsc::Sender<DecisionMessage>) -> bool {
        let sender = query.from.id;
        let Some(message) = query.data.as_deref().and_then(|data| parse_callback(data, sender)) else {
            debug!(data = ?query.data, "[APPROVAL] Ignoring unknown callback");
            self.answer(&query.id, "Unknown action").await;
            return true;
        };
        // Receipt only. The gateway may still refuse the decision.
        let label = match message.decision {
            Decision::Approved => "Approval queued",
            Decision::Rejected => "Rejection queued",
        };
        info!(post_id = %message.post_id, admin = sender, decision = message.decision.as_str(), "[APPROVAL] Decision received");
        if decisions.send(message).await.is_err() {
            return false;
        }
        self.answer(&query.id, label).await;
        match query.message {
            Some(origin) if origin.chat.id == sender => self.clear_buttons(origin.chat.id, origin.message_id).await,
            _ => {}
        }
        true
    }

    async fn answer(&self, callback_id: &str, text: &str) {
        let body = json!({ "callback_query_id": callback_id, "text": text });
        if let Err(e) = self.call::<Value>("answerCallbackQuery", &body).await {
            warn!(error = %e, "[APPROVAL] answerCallbackQuery failed");
        }
    }

    async fn clear_buttons(&self, chat_id: i64, message_id: i64) {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": { "inline_keyboard": [] },
        });
        if let Err(e) = self.call::<Value>("editMessageReplyMarkup", &body).await {
            debug!(error = %e, "[APPROVAL] Could not remove approval buttons");
        }
    }
}

#[async_trait]
impl Destination for TelegramClient {
    async fn deliver(
        &self,
        channel: &str,
        asset: &PreparedAsset,
        metadata: &PostMetadata,
    ) -> Result<(), DeliveryError> {
        let caption = caption(metadata);
        let first = asset
            .files
            .first()
            .ok_or_else(|| DeliveryError::Permanent("prepared asset has no files".to_string()))?;
        match asset.kind {
            AssetKind::Photo => self.send_file("sendPhoto", "photo", channel, &caption, first).await,
            AssetKind::Video => self.send_file("sendVideo", "video", channel, &caption, first).await,
            AssetKind::Album if asset.files.len() == 1 => {
                self.send_file("sendPhoto", "photo", channel, &caption, first).await
            }
            AssetKind::Album => self.send_album(channel, &caption, &asset.files).await,
        }
    }
}

#[async_trait]
impl AdminNotifier for TelegramClient {
    async fn present_for_approval(
        &self,
        admin: AdminId,
        post: &Post,
        preview: &Preview,
    ) -> Result<ApprovalTicket, NotifyError> {
        let link_preview = match &preview.media_url {
            Some(url) => json!({ "url": url, "prefer_large_media": true }),
            None => json!({ "is_disabled": true }),
        };
        let body = json!({
            "chat_id": admin,
            "text": truncate_chars(&preview.text, MESSAGE_LIMIT),
            "reply_markup": approval_keyboard(&post.id),
            "link_preview_options": link_preview,
        });
        let sent: Message = self.call("sendMessage", &body).await?;
        Ok(ApprovalTicket(sent.message_id.to_string()))
    }

    async fn notify(&self, admin: AdminId, message: &str) -> Result<(), NotifyError> {
        let body = json!({
            "chat_id": admin,
            "text": truncate_chars(message, MESSAGE_LIMIT),
            "link_preview_options": { "is_disabled": true },
        });
        self.call::<Message>("sendMessage", &body).await?;
        Ok(())
    }
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let envelope: Envelope<T> = response
        .json()
        .await
        .map_err(|e| ApiError::Malformed(format!("{status}: {e}")))?;
    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| ApiError::Malformed("ok response without a result".to_string()));
    }
    Err(ApiError::Rejected {
        code: envelope.error_code.unwrap_or(status.as_u16()),
        description: envelope.description.unwrap_or_default(),
    })
}

async fn file_part(path: &Path) -> Result<Part, DeliveryError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| DeliveryError::Permanent(format!("cannot read {}: {e}", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    Ok(Part::bytes(bytes).file_name(name))
}

fn approval_keyboard(id: &PostId) -> Value {
    json!({
        "inline_keyboard": [[
            { "text": "Approve", "callback_data": format!("approve:{id}") },
            { "text": "Reject", "callback_data": format!("reject:{id}") },
        ]]
    })
}

/// Parse the `callback_data` of an approval button pressed by `admin`.
pub fn parse_callback(data: &str, admin: AdminId) -> Option<DecisionMessage> {
    let (action, id) = data.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    let decision = match action {
        "approve" => Decision::Approved,
        "reject" => Decision::Rejected,
        _ => return None,
    };
    Some(DecisionMessage {
        post_id: PostId::from(id),
        decision,
        admin,
    })
}

/// Channel caption: the title, then the subreddit and a link back, within Telegram's limit.
pub fn caption(meta: &PostMetadata) -> String {
    let link = if meta.permalink.starts_with("http") || meta.permalink.is_empty() {
        meta.permalink.clone()
    } else {
        format!("https://reddit.com{}", meta.permalink)
    };
    let mut footer = String::new();
    if !meta.subreddit.is_empty() {
        footer.push_str(&format!("r/{}", meta.subreddit));
    }
    if !link.is_empty() {
        if !footer.is_empty() {
            footer.push_str(" | ");
        }
        footer.push_str(&link);
    }
    if footer.is_empty() {
        return truncate_chars(&meta.title, CAPTION_LIMIT);
    }
    let budget = CAPTION_LIMIT.saturating_sub(footer.chars().count() + 2);
    let title = truncate_chars(&meta.title, budget);
    if title.is_empty() {
        footer
    } else {
        format!("{title}\n\n{footer}")
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut cut: String = text.chars().take(max - 1).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_data_round_trips_through_the_keyboard() {
        let id = PostId::from("7-0123456789abcdef");
        let keyboard = approval_keyboard(&id);
        let approve = keyboard["inline_keyboard"][0][0]["callback_data"].as_str().unwrap();
        let reject = keyboard["inline_keyboard"][0][1]["callback_data"].as_str().unwrap();

        assert_eq!(
            parse_callback(approve, 42),
            Some(DecisionMessage { post_id: id.clone(), decision: Decision::Approved, admin: 42 })
        );
        assert_eq!(parse_callback(reject, 42).map(|m| m.decision), Some(Decision::Rejected));
        assert!(approve.len() <= 64);
    }

    #[test]
    fn malformed_callbacks_are_ignored() {
        assert_eq!(parse_callback("approve", 42), None);
        assert_eq!(parse_callback("approve:", 42), None);
        assert_eq!(parse_callback("delete:7-abc", 42), None);
    }

    #[test]
    fn caption_fits_the_limit_and_keeps_the_link() {
        let meta = PostMetadata {
            title: "x".repeat(3000),
            subreddit: "pics".to_string(),
            permalink: "/r/pics/comments/abc/".to_string(),
            ..PostMetadata::default()
        };
        let text = caption(&meta);
        assert_eq!(text.chars().count(), CAPTION_LIMIT);
        assert!(text.ends_with("r/pics | https://reddit.com/r/pics/comments/abc/"));

        let short = caption(&PostMetadata {
            title: "A cat".to_string(),
            ..PostMetadata::default()
        });
        assert_eq!(short, "A cat");
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        let throttled = ApiError::Rejected { code: 429, description: "Too Many Requests".into() };
        assert!(DeliveryError::from(throttled).is_transient());
        let forbidden = ApiError::Rejected { code: 403, description: "bot is not a member".into() };
        assert!(!DeliveryError::from(forbidden).is_transient());
        assert!(DeliveryError::from(ApiError::Transport("reset".into())).is_transient());
    }
}
