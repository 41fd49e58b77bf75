//! Finding `ffmpeg` and `ffprobe`.
//!
//! Lookup order per tool: environment override, configured path, the standard install
//! directories below, then `PATH` via `which`. The result of the first successful
//! discovery is cached for the life of the process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

pub const FFMPEG_ENV: &str = "RELAY_FFMPEG";
pub const FFPROBE_ENV: &str = "RELAY_FFPROBE";

const CANDIDATE_DIRS: &[&str] = &[
    "/usr/bin",
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/opt/local/bin",
    "/snap/bin",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocateError {
    #[error("{name} not found: set {env} or install it under one of {dirs}")]
    NotFound {
        name: &'static str,
        env: &'static str,
        dirs: String,
    },
    #[error("{name} override {path} is not an executable file")]
    BadOverride { name: &'static str, path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Executables {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    search_path: OsString,
}

static DISCOVERED: OnceLock<Executables> = OnceLock::new();

impl Executables {
    /// Locate both tools once per process.
    pub fn discover(ffmpeg: Option<&Path>, ffprobe: Option<&Path>) -> Result<Self, LocateError> {
        if let Some(found) = DISCOVERED.get() {
            return Ok(found.clone());
        }
        let found = Self::locate(ffmpeg, ffprobe)?;
        info!(
            ffmpeg = %found.ffmpeg.display(),
            ffprobe = %found.ffprobe.display(),
            "[PIPELINE] Located media executables"
        );
        Ok(DISCOVERED.get_or_init(|| found).clone())
    }

    /// Uncached lookup.
    pub fn locate(ffmpeg: Option<&Path>, ffprobe: Option<&Path>) -> Result<Self, LocateError> {
        Ok(Executables {
            ffmpeg: find_tool("ffmpeg", FFMPEG_ENV, ffmpeg)?,
            ffprobe: find_tool("ffprobe", FFPROBE_ENV, ffprobe)?,
            search_path: search_path(),
        })
    }

    /// Use the given binaries as-is.
    pub fn explicit(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Executables {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            search_path: search_path(),
        }
    }

    /// A command for `program` with a `PATH` that includes the standard install
    /// directories, no stdin, and the child killed if the handle is dropped.
    pub fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("PATH", &self.search_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

fn find_tool(name: &'static str, env: &'static str, configured: Option<&Path>) -> Result<PathBuf, LocateError> {
    if let Some(raw) = std::env::var_os(env).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(raw);
        return if is_executable(&path) {
            debug!(tool = name, path = %path.display(), "Using executable from environment override");
            Ok(path)
        } else {
            Err(LocateError::BadOverride { name, path })
        };
    }
    if let Some(path) = configured {
        return if is_executable(path) {
            Ok(path.to_path_buf())
        } else {
            Err(LocateError::BadOverride {
                name,
                path: path.to_path_buf(),
            })
        };
    }
    if let Some(path) = CANDIDATE_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|p| is_executable(p))
    {
        return Ok(path);
    }
    which::which(name).map_err(|_| LocateError::NotFound {
        name,
        env,
        dirs: CANDIDATE_DIRS.join(", "),
    })
}

fn search_path() -> OsString {
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    for dir in CANDIDATE_DIRS {
        let dir = PathBuf::from(dir);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    std::env::join_paths(dirs).unwrap_or_default()
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_path_contains_standard_dirs() {
        let path = search_path();
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        assert!(dirs.contains(&PathBuf::from("/usr/local/bin")));
    }

    #[test]
    fn configured_path_must_be_executable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ffmpeg");
        let err = find_tool("ffmpeg", "RELAY_TEST_UNSET_OVERRIDE", Some(&missing)).unwrap_err();
        assert!(matches!(err, LocateError::BadOverride { .. }));
    }
}
