//! Media pipeline: turns an approved post into a delivery-ready asset.
//!
//! Stages run in order inside a per-job scoped workspace under `work_dir`:
//! download, merge (only when audio arrives separately), re-encode (video only) and
//! verify. Every stage writes a new file, so a failing stage never touches the output
//! of the one before it. The workspace is a [`tempfile::TempDir`] owned by the job
//! future and removed on every exit path, including cancellation. Only the verified
//! output is moved to `assets_dir/<post id>/`.

pub mod download;
pub mod executables;
pub mod transcode;
pub mod verify;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::contract::MediaPreparer;
use crate::error::PipelineError;
use crate::model::{AssetKind, MediaType, Post, PreparedAsset};

use download::{dash_audio_candidates, resolve_media_url, Downloader, MIN_STREAM_BYTES};
use executables::{Executables, LocateError};
use transcode::Transcoder;

const WORKSPACE_PREFIX: &str = "job-";

pub struct MediaPipeline {
    config: PipelineConfig,
    downloader: Downloader,
    transcoder: Transcoder,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineSetupError {
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl MediaPipeline {
    /// Build a pipeline, locating `ffmpeg`/`ffprobe` once for the process.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineSetupError> {
        let exes = Executables::discover(config.ffmpeg_path.as_deref(), config.ffprobe_path.as_deref())?;
        Self::with_executables(config, exes)
    }

    pub fn with_executables(config: PipelineConfig, exes: Executables) -> Result<Self, PipelineSetupError> {
        let downloader = Downloader::new(config.download_timeout, config.download_attempts)?;
        let transcoder = Transcoder::new(exes, config.clone());
        Ok(MediaPipeline {
            config,
            downloader,
            transcoder,
        })
    }

    /// Remove workspaces left behind by a process that did not exit cleanly.
    pub async fn clean_stale_workspaces(&self) -> std::io::Result<usize> {
        remove_workspaces(&self.config.work_dir).await
    }

    async fn prepare_image(&self, post: &Post, dir: &Path) -> Result<(AssetKind, Vec<PathBuf>), PipelineError> {
        let url = first_url(post)?;
        let file = self
            .downloader
            .fetch(&resolve_media_url(url, MediaType::Image), dir, "image", 1)
            .await?;
        verify::verify_image(&file).await?;
        Ok((AssetKind::Photo, vec![file]))
    }

    async fn prepare_gallery(&self, post: &Post, dir: &Path) -> Result<(AssetKind, Vec<PathBuf>), PipelineError> {
        let downloads = post
            .media_urls
            .iter()
            .take(self.config.max_gallery_items)
            .enumerate()
            .map(|(index, url)| async move {
                let file = self
                    .downloader
                    .fetch(&resolve_media_url(url, MediaType::Image), dir, &format!("item-{index:02}"), 1)
                    .await?;
                verify::verify_image(&file).await?;
                Ok::<_, PipelineError>(file)
            });
        let files = try_join_all(downloads).await?;
        if files.is_empty() {
            return Err(PipelineError::DownloadFailed {
                attempts: 0,
                reason: "gallery has no items".to_string(),
            });
        }
        Ok((AssetKind::Album, files))
    }

    async fn prepare_video(&self, post: &Post, dir: &Path) -> Result<(AssetKind, Vec<PathBuf>), PipelineError> {
        let url = resolve_media_url(first_url(post)?, MediaType::Video);
        let video = self.downloader.fetch(&url, dir, "video", MIN_STREAM_BYTES).await?;

        let audio_candidates = dash_audio_candidates(&url);
        let audio = if audio_candidates.is_empty() {
            None
        } else {
            self.downloader.fetch_first(&audio_candidates, dir, "audio").await
        };

        let source = match audio {
            Some(audio) => {
                let merged = dir.join("merged.mp4");
                self.transcoder.merge(&video, &audio, &merged).await?;
                merged
            }
            None => {
                info!(post_id = %post.id, "[PIPELINE] No separate audio stream, encoding video only");
                video
            }
        };

        let encoded = dir.join("encoded.mp4");
        self.transcoder.encode(&source, &encoded).await?;
        let duration = verify::verify_video(self.transcoder.executables(), &encoded).await?;
        info!(post_id = %post.id, duration_secs = duration.as_secs_f32(), "[PIPELINE] Video verified");
        Ok((AssetKind::Video, vec![encoded]))
    }

    async fn publish(&self, post: &Post, kind: AssetKind, files: Vec<PathBuf>) -> Result<PreparedAsset, PipelineError> {
        let root = self.config.assets_dir.join(post.id.as_str());
        if tokio::fs::metadata(&root).await.is_ok() {
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(&root).await?;

        let mut published = Vec::with_capacity(files.len());
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "asset".into());
            let dest = root.join(name);
            move_file(&file, &dest).await?;
            published.push(dest);
        }
        Ok(PreparedAsset {
            kind,
            root,
            files: published,
        })
    }
}

#[async_trait]
impl MediaPreparer for MediaPipeline {
    async fn prepare(&self, post: &Post) -> Result<PreparedAsset, PipelineError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let job = Uuid::new_v4();
        let workspace = tempfile::Builder::new()
            .prefix(&format!("{WORKSPACE_PREFIX}{}-", post.id))
            .tempdir_in(&self.config.work_dir)?;
        info!(
            post_id = %post.id,
            job = %job,
            media_type = post.media_type.as_str(),
            workspace = %workspace.path().display(),
            "[PIPELINE] Job started"
        );

        let staged = match post.media_type {
            MediaType::Image => self.prepare_image(post, workspace.path()).await,
            MediaType::Gallery => self.prepare_gallery(post, workspace.path()).await,
            MediaType::Video => self.prepare_video(post, workspace.path()).await,
            MediaType::Text => Err(PipelineError::DownloadFailed {
                attempts: 0,
                reason: "text posts carry no media".to_string(),
            }),
        };
        let result = match staged {
            Ok((kind, files)) => self.publish(post, kind, files).await,
            Err(e) => Err(e),
        };

        let workspace_path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(error = ?e, workspace = %workspace_path.display(), "[PIPELINE] Failed to remove job workspace");
        }
        match &result {
            Ok(asset) => info!(post_id = %post.id, job = %job, files = asset.files.len(), "[PIPELINE] Job finished"),
            Err(e) => error!(post_id = %post.id, job = %job, kind = e.kind(), error = %e, "[PIPELINE] Job failed"),
        }
        result
    }
}

fn first_url(post: &Post) -> Result<&str, PipelineError> {
    post.media_urls
        .first()
        .map(String::as_str)
        .ok_or_else(|| PipelineError::DownloadFailed {
            attempts: 0,
            reason: "post has no media url".to_string(),
        })
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Different filesystems.
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Delete every `job-*` directory directly under `work_dir`.
pub async fn remove_workspaces(work_dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let is_workspace = entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX);
        if is_workspace && entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, work_dir = %work_dir.display(), "[PIPELINE] Removed stale job workspaces");
    }
    Ok(removed)
}
