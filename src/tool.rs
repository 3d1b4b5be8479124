#![forbid(unsafe_code)]

//! Locates the yt-dlp binary, downloads it from GitHub releases when the
//! service manages its own copy, and keeps it updated.

use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::ytdlp::YtDlp;

const STABLE_RELEASES: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
const NIGHTLY_RELEASES: &str =
    "https://github.com/yt-dlp/yt-dlp-nightly-builds/releases/latest/download";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
// The standalone binaries are a few dozen MiB; anything far beyond that is
// not yt-dlp.
const MAX_BINARY_BYTES: u64 = 256 * 1024 * 1024;

/// Where the binary lives, and whether we are allowed to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolLocation {
    /// Configured by the user; never downloaded or replaced.
    Explicit(PathBuf),
    /// Kept under the service's data directory.
    Managed { path: PathBuf, present: bool },
}

impl ToolLocation {
    pub fn path(&self) -> &Path {
        match self {
            ToolLocation::Explicit(path) => path,
            ToolLocation::Managed { path, .. } => path,
        }
    }
}

pub fn binary_name() -> &'static str {
    if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" }
}

fn release_asset() -> &'static str {
    if cfg!(windows) {
        "yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else if cfg!(target_arch = "aarch64") {
        "yt-dlp_linux_aarch64"
    } else {
        "yt-dlp"
    }
}

pub fn release_url(nightlies: bool) -> String {
    let base = if nightlies {
        NIGHTLY_RELEASES
    } else {
        STABLE_RELEASES
    };
    format!("{base}/{}", release_asset())
}

/// Per-user data directory for the managed binary.
pub fn managed_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "TubePulse").map(|dirs| dirs.data_local_dir().to_path_buf())
}

pub fn locate(explicit: Option<&Path>, managed_dir: Option<&Path>) -> Result<ToolLocation> {
    // Downloads run with the channel directory as cwd, so a relative path
    // has to be pinned down before it is ever spawned.
    if let Some(path) = explicit {
        let absolute = fs::canonicalize(path)
            .with_context(|| format!("configured yt-dlp binary {} does not exist", path.display()))?;
        if !absolute.is_file() {
            bail!("configured yt-dlp binary {} is not a file", path.display());
        }
        return Ok(ToolLocation::Explicit(absolute));
    }

    let dir = managed_dir.ok_or_else(|| anyhow!("could not determine a data directory for yt-dlp"))?;
    let path = dir.join(binary_name());
    let present = path.is_file();
    Ok(ToolLocation::Managed { path, present })
}

/// Returns a usable yt-dlp, downloading the managed copy when it is missing.
pub async fn ensure_ytdlp(explicit: Option<&Path>, nightlies: bool) -> Result<YtDlp> {
    let managed = managed_dir();
    let location = locate(explicit, managed.as_deref())?;

    if let ToolLocation::Managed {
        path,
        present: false,
    } = &location
    {
        let url = release_url(nightlies);
        tracing::info!(url = %url, target = %path.display(), "yt-dlp not found, downloading");
        let target = path.clone();
        tokio::task::spawn_blocking(move || download_binary(&url, &target))
            .await
            .context("joining yt-dlp download task")??;
        tracing::info!(path = %path.display(), "yt-dlp downloaded");
    }

    Ok(YtDlp::new(location.path()))
}

fn download_binary(url: &str, target: &Path) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let agent = ureq::AgentBuilder::new().timeout(DOWNLOAD_TIMEOUT).build();
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("downloading {url}"))?;

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_BINARY_BYTES)
        .read_to_end(&mut bytes)
        .with_context(|| format!("reading response body from {url}"))?;
    if bytes.is_empty() {
        bail!("downloaded yt-dlp from {url} is empty");
    }

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(&bytes)
        .with_context(|| format!("writing {}", target.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o755))
            .with_context(|| format!("marking {} executable", target.display()))?;
    }

    tmp.persist(target)
        .with_context(|| format!("installing {}", target.display()))?;
    Ok(())
}

pub fn update_args(nightlies: bool) -> Vec<&'static str> {
    if nightlies {
        vec!["--update-to", "nightly"]
    } else {
        vec!["-U"]
    }
}

/// Asks yt-dlp to update itself. Callers treat failure as a warning: a
/// package-managed yt-dlp refuses `-U` and keeps working as it is.
pub async fn update_ytdlp(ytdlp: &YtDlp, nightlies: bool) -> Result<()> {
    let release = if nightlies { "nightly" } else { "stable" };
    tracing::info!(release, "updating yt-dlp");

    let output = ytdlp
        .command()
        .args(update_args(nightlies))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("running {} update", ytdlp.path().display()))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let line = line.trim();
        if !line.is_empty() {
            tracing::info!(target: "tubepulse::ytdlp", "{line}");
        }
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "yt-dlp update exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    Ok(())
}
