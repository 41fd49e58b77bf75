//! Final sanity checks on prepared files. A failure here is never retried.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::error::PipelineError;
use crate::media::executables::Executables;
use crate::media::transcode::file_len;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Non-empty and a positive duration according to `ffprobe`.
pub async fn verify_video(exes: &Executables, path: &Path) -> Result<Duration, PipelineError> {
    if file_len(path).await == 0 {
        return Err(PipelineError::VerifyFailed(format!("{} is empty", path.display())));
    }

    let child = exes
        .command(&exes.ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PipelineError::VerifyFailed(format!("failed to launch ffprobe: {e}")))?;

    let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| PipelineError::VerifyFailed("ffprobe timed out".to_string()))?
        .map_err(|e| PipelineError::VerifyFailed(format!("ffprobe failed: {e}")))?;
    if !output.status.success() {
        return Err(PipelineError::VerifyFailed(format!("ffprobe exited with {}", output.status)));
    }

    parse_duration(&String::from_utf8_lossy(&output.stdout))
}

/// Turn ffprobe's `format=duration` output into a playable duration.
fn parse_duration(reported: &str) -> Result<Duration, PipelineError> {
    let reported = reported.trim();
    let seconds: f64 = reported
        .parse()
        .map_err(|_| PipelineError::VerifyFailed(format!("unreadable duration {reported:?}")))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(PipelineError::VerifyFailed(format!("not playable: duration {seconds}")));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| PipelineError::VerifyFailed(format!("duration {seconds} out of range: {e}")))
}

/// Non-empty and starting with the signature of an image format the destination accepts.
pub async fn verify_image(path: &Path) -> Result<(), PipelineError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::VerifyFailed(format!("opening {}: {e}", path.display())))?;
    let mut head = [0u8; 12];
    let mut filled = 0;
    while filled < head.len() {
        let n = file
            .read(&mut head[filled..])
            .await
            .map_err(|e| PipelineError::VerifyFailed(format!("reading {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Err(PipelineError::VerifyFailed(format!("{} is empty", path.display())));
    }
    if is_known_image(&head[..filled]) {
        Ok(())
    } else {
        Err(PipelineError::VerifyFailed(format!(
            "{} is not a jpeg, png, webp or gif image",
            path.display()
        )))
    }
}

fn is_known_image(head: &[u8]) -> bool {
    head.starts_with(&[0xFF, 0xD8, 0xFF])
        || head.starts_with(b"\x89PNG")
        || head.starts_with(b"GIF8")
        || (head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_image_signatures() {
        assert!(is_known_image(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(is_known_image(b"\x89PNG\r\n\x1a\n"));
        assert!(is_known_image(b"RIFF\x00\x00\x00\x00WEBP"));
        assert!(!is_known_image(b"<html>"));
    }

    #[test]
    fn reported_durations_must_be_positive_and_in_range() {
        assert_eq!(parse_duration("12.5\n").unwrap(), Duration::from_millis(12_500));
        assert!(matches!(parse_duration("N/A"), Err(PipelineError::VerifyFailed(_))));
        assert!(matches!(parse_duration("0.000000"), Err(PipelineError::VerifyFailed(_))));
        assert!(matches!(parse_duration("1e300"), Err(PipelineError::VerifyFailed(_))));
    }
}
