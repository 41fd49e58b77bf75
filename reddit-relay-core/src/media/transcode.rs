//! Merge and re-encode stages, both run through `ffmpeg`.
//!
//! Merging copies codecs on the first attempt and re-encodes the audio track on later
//! attempts. Re-encoding always produces H.264/yuv420p MP4 with the moov atom up front,
//! which the destination needs for inline playback and thumbnails.
//! Encoder processes are capped by a semaphore shared across all jobs.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::media::download::MIN_STREAM_BYTES;
use crate::media::executables::Executables;

pub struct Transcoder {
    exes: Executables,
    config: PipelineConfig,
    encode_slots: Arc<Semaphore>,
}

impl Transcoder {
    pub fn new(exes: Executables, config: PipelineConfig) -> Self {
        let encode_slots = Arc::new(Semaphore::new(config.max_concurrent_encodes.max(1)));
        Transcoder {
            exes,
            config,
            encode_slots,
        }
    }

    pub fn executables(&self) -> &Executables {
        &self.exes
    }

    pub async fn merge(&self, video: &Path, audio: &Path, out: &Path) -> Result<(), PipelineError> {
        let attempts = self.config.merge_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let mut args = vec![
                "-y".to_string(),
                "-i".to_string(),
                path_arg(video),
                "-i".to_string(),
                path_arg(audio),
                "-map".to_string(),
                "0:v:0".to_string(),
                "-map".to_string(),
                "1:a:0".to_string(),
                "-c:v".to_string(),
                "copy".to_string(),
            ];
            if attempt == 1 {
                args.extend(["-c:a", "copy"].map(String::from));
            } else {
                args.extend(["-c:a", "aac", "-b:a", "128k"].map(String::from));
            }
            args.extend(["-movflags", "+faststart", "-shortest"].map(String::from));
            args.push(path_arg(out));

            match run_tool(&self.exes, &self.exes.ffmpeg, &args, self.config.merge_timeout).await {
                Ok(()) if file_len(out).await >= MIN_STREAM_BYTES => {
                    info!(attempt, out = %out.display(), "[PIPELINE] Merged audio and video");
                    return Ok(());
                }
                Ok(()) => last_error = "merged output is empty".to_string(),
                Err(reason) => last_error = reason,
            }
            warn!(attempt, error = %last_error, "[PIPELINE] Merge attempt failed");
        }
        Err(PipelineError::MergeFailed {
            attempts,
            reason: last_error,
        })
    }

    pub async fn encode(&self, input: &Path, out: &Path) -> Result<(), PipelineError> {
        let attempts = self.config.encode_attempts.max(1);
        let _slot = self
            .encode_slots
            .acquire()
            .await
            .map_err(|_| PipelineError::EncodeFailed {
                attempts: 0,
                reason: "encoder pool closed".to_string(),
            })?;

        let scale = format!(
            "scale=trunc(iw*min(1\\,{h}/ih)/2)*2:trunc(min(ih\\,{h})/2)*2",
            h = self.config.max_video_height
        );
        let args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            path_arg(input),
            "-t".into(),
            self.config.max_video_duration.as_secs().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-vf".into(),
            scale,
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.config.encoder_preset.clone(),
            "-crf".into(),
            "23".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-threads".into(),
            self.config.encoder_threads.max(1).to_string(),
            path_arg(out),
        ];

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match run_tool(&self.exes, &self.exes.ffmpeg, &args, self.config.encode_timeout).await {
                Ok(()) => {
                    info!(attempt, out = %out.display(), "[PIPELINE] Re-encoded video");
                    return Ok(());
                }
                Err(reason) => last_error = reason,
            }
            warn!(attempt, error = %last_error, "[PIPELINE] Encode attempt failed");
            let _ = tokio::fs::remove_file(out).await;
        }
        Err(PipelineError::EncodeFailed {
            attempts,
            reason: last_error,
        })
    }
}

/// Run `program` to completion within `timeout`. The child is killed when the timeout
/// fires because the handle is dropped with `kill_on_drop` set.
pub(crate) async fn run_tool(
    exes: &Executables,
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<(), String> {
    let child = exes
        .command(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to launch {}: {e}", program.display()))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => Err(format!(
            "{} timed out after {}s",
            program.display(),
            timeout.as_secs_f32()
        )),
        Ok(Err(e)) => Err(format!("waiting on {}: {e}", program.display())),
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            Err(format!("{} exited with {}: {tail}", program.display(), output.status))
        }
    }
}

pub(crate) async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
