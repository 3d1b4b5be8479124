#![forbid(unsafe_code)]

//! Thin wrapper around the yt-dlp executable.
//!
//! Listing runs `yt-dlp -j --flat-playlist`, which prints one JSON object per
//! line on stdout. Downloads run in the channel's directory with stdio
//! inherited so yt-dlp's own progress output lands in the service log.

use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const SHORTS_FILTER: &str = "original_url!*=/shorts/ & url!*=/shorts/";

#[derive(Debug, Error)]
pub enum YtDlpError {
    #[error("yt-dlp run was cancelled")]
    Cancelled,
    #[error("failed to start {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error while running yt-dlp: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of a flat playlist listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEntry {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
}

impl VideoEntry {
    /// Field names are matched case-insensitively. `url` falls back to
    /// `webpage_url` and `original_url`; entries without an id are dropped.
    pub fn from_json_line(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let object = value.as_object()?;

        let id = string_field(object, "id")?;
        let url = string_field(object, "url")
            .or_else(|| string_field(object, "webpage_url"))
            .or_else(|| string_field(object, "original_url"))?;
        let title = string_field(object, "title");

        Some(Self { id, url, title })
    }
}

fn string_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    object
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Decodes yt-dlp's line-delimited JSON, skipping anything that is not a
/// usable video record.
pub fn parse_video_lines(output: &str) -> Vec<VideoEntry> {
    let mut videos = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match VideoEntry::from_json_line(line) {
            Some(video) => videos.push(video),
            None => tracing::debug!(line, "skipping unparseable yt-dlp output line"),
        }
    }
    videos
}

pub fn listing_args(url: &str, date_after: Option<&str>, skip_shorts: bool) -> Vec<String> {
    let mut args = vec!["-j".to_string(), "--flat-playlist".to_string()];
    if let Some(date) = date_after.map(str::trim).filter(|date| !date.is_empty()) {
        args.push("--dateafter".to_string());
        args.push(date.to_string());
    }
    if skip_shorts {
        args.push("--match-filter".to_string());
        args.push(SHORTS_FILTER.to_string());
    }
    args.push(url.to_string());
    args
}

/// Best video capped at `resolution` plus best audio, falling back to the
/// best muxed stream under the cap and finally to the worst available.
pub fn format_selector(resolution: Option<&str>) -> String {
    match resolution.map(str::trim).filter(|value| !value.is_empty()) {
        Some(height) => format!("bv*[height<={height}]+ba/b[height<={height}] / wv*+ba/w"),
        None => "bv*+ba/b".to_string(),
    }
}

pub fn download_args(url: &str, resolution: Option<&str>, sleep_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        format_selector(resolution),
        url.to_string(),
        "--write-thumbnail".to_string(),
        "--convert-thumbnails".to_string(),
        "jpg".to_string(),
    ];
    args.extend(sleep_args.iter().cloned());
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Failed(Option<i32>),
}

impl DownloadOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Self::Completed
        } else {
            Self::Failed(status.code())
        }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    path: PathBuf,
}

impl YtDlp {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.path);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> YtDlpError {
        YtDlpError::Spawn {
            program: self.path.clone(),
            source,
        }
    }

    /// Runs `yt-dlp --version` and returns the trimmed version string.
    pub async fn version(&self) -> Result<String, YtDlpError> {
        let output = self
            .command()
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;
        if !output.status.success() {
            return Err(YtDlpError::Io(std::io::Error::other(format!(
                "{} --version exited with {}",
                self.path.display(),
                output.status
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Lists the channel's videos. A non-zero exit is only logged: yt-dlp
    /// exits with an error when a single entry fails, yet still prints
    /// every other entry.
    pub async fn list_videos(
        &self,
        url: &str,
        date_after: Option<&str>,
        skip_shorts: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoEntry>, YtDlpError> {
        let args = listing_args(url, date_after, skip_shorts);
        tracing::debug!(args = ?args, "listing channel videos");

        let child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| self.spawn_error(err))?;

        // Dropping the output future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                tracing::info!(url, "yt-dlp listing terminated due to shutdown");
                return Err(YtDlpError::Cancelled);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let videos = parse_video_lines(&stdout);
        tracing::info!(url, count = videos.len(), "fetched videos");

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            tracing::warn!(url, stderr, "yt-dlp reported problems while listing");
        }
        if !output.status.success() {
            tracing::warn!(url, status = %output.status, "yt-dlp listing exited with failure");
        }

        Ok(videos)
    }

    /// Downloads one video into `dir`, creating it first.
    pub async fn download(
        &self,
        url: &str,
        dir: &Path,
        resolution: Option<&str>,
        sleep_args: &[String],
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, YtDlpError> {
        tokio::fs::create_dir_all(dir).await?;

        let args = download_args(url, resolution, sleep_args);
        tracing::info!(
            url,
            resolution = resolution.unwrap_or("best"),
            dir = %dir.display(),
            "downloading video"
        );
        tracing::debug!(command = %format!("yt-dlp {}", args.join(" ")), "executing");

        let mut child = self
            .command()
            .args(args.iter().map(OsString::from))
            .current_dir(dir)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| self.spawn_error(err))?;

        tokio::select! {
            status = child.wait() => {
                let outcome = DownloadOutcome::from_status(status?);
                match outcome {
                    DownloadOutcome::Completed => tracing::info!(url, "download completed successfully"),
                    DownloadOutcome::Failed(code) => {
                        tracing::warn!(url, exit_code = ?code, "download failed")
                    }
                }
                Ok(outcome)
            }
            _ = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "could not kill yt-dlp");
                }
                tracing::info!(url, "yt-dlp process terminated due to shutdown");
                Err(YtDlpError::Cancelled)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_case_insensitively() {
        let output = concat!(
            "{\"id\":\"a1\",\"url\":\"https://youtu.be/a1\",\"title\":\"First\"}\n",
            "\n",
            "[download] not json\n",
            "{\"ID\":\"b2\",\"Webpage_URL\":\"https://youtu.be/b2\"}\n",
            "{\"title\":\"no id\",\"url\":\"https://youtu.be/zz\"}\n",
            "[1,2,3]\n",
        );
        let videos = parse_video_lines(output);
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].id, "a1");
        assert_eq!(videos[0].title.as_deref(), Some("First"));
        assert_eq!(videos[1].id, "b2");
        assert_eq!(videos[1].url, "https://youtu.be/b2");
    }

    #[test]
    fn listing_args_match_flat_playlist_shape() {
        assert_eq!(
            listing_args("https://www.youtube.com/@alpha", Some("today-1day"), true),
            vec![
                "-j",
                "--flat-playlist",
                "--dateafter",
                "today-1day",
                "--match-filter",
                SHORTS_FILTER,
                "https://www.youtube.com/@alpha",
            ]
        );
        assert_eq!(
            listing_args("https://www.youtube.com/@alpha", None, false),
            vec!["-j", "--flat-playlist", "https://www.youtube.com/@alpha"]
        );
    }

    #[test]
    fn format_selector_caps_height() {
        assert_eq!(
            format_selector(Some("720")),
            "bv*[height<=720]+ba/b[height<=720] / wv*+ba/w"
        );
        assert_eq!(format_selector(Some(" ")), "bv*+ba/b");
        assert_eq!(format_selector(None), "bv*+ba/b");
    }

    #[test]
    fn download_args_append_sleep_flags() {
        let sleep = vec!["--sleep-interval".to_string(), "6".to_string()];
        let args = download_args("https://youtu.be/a1", Some("1080"), &sleep);
        assert_eq!(args[0], "-f");
        assert_eq!(args[2], "https://youtu.be/a1");
        assert_eq!(
            &args[3..],
            &[
                "--write-thumbnail",
                "--convert-thumbnails",
                "jpg",
                "--sleep-interval",
                "6"
            ]
        );
    }

    #[cfg(unix)]
    mod process {
        use super::super::test_support::{install_stub, process_lock};
        use super::super::*;
        use std::fs;
        use std::time::{Duration, Instant};
        use tempfile::tempdir;

        #[tokio::test]
        async fn list_videos_reads_stub_output() {
            let dir = tempdir().unwrap();
            let stub = install_stub(
                dir.path(),
                r#"echo '{"id":"a1","url":"https://youtu.be/a1"}'
echo 'garbage'
echo '{"id":"b2","url":"https://youtu.be/b2"}'
echo 'WARNING: something odd' >&2
exit 1"#,
            );
            let ytdlp = YtDlp::new(stub.path());
            let videos = ytdlp
                .list_videos("https://example.com", None, true, &CancellationToken::new())
                .await
                .unwrap();
            let ids: Vec<_> = videos.iter().map(|video| video.id.as_str()).collect();
            assert_eq!(ids, vec!["a1", "b2"]);
        }

        #[tokio::test]
        async fn list_videos_stops_on_cancel() {
            let dir = tempdir().unwrap();
            let stub = install_stub(dir.path(), "exec sleep 30");
            let ytdlp = YtDlp::new(stub.path());
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let err = ytdlp
                .list_videos("https://example.com", None, true, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, YtDlpError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn download_runs_in_target_dir() {
            let dir = tempdir().unwrap();
            let stub = install_stub(dir.path(), r#"printf '%s\n' "$@" > args.txt"#);
            let target = dir.path().join("downloads").join("alpha");
            let ytdlp = YtDlp::new(stub.path());
            let outcome = ytdlp
                .download(
                    "https://youtu.be/a1",
                    &target,
                    Some("480"),
                    &[],
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(outcome, DownloadOutcome::Completed);

            let recorded = fs::read_to_string(target.join("args.txt")).unwrap();
            let recorded: Vec<&str> = recorded.lines().collect();
            assert_eq!(recorded[0], "-f");
            assert_eq!(recorded[1], "bv*[height<=480]+ba/b[height<=480] / wv*+ba/w");
            assert_eq!(recorded[2], "https://youtu.be/a1");
        }

        #[tokio::test]
        async fn download_reports_exit_code() {
            let dir = tempdir().unwrap();
            let stub = install_stub(dir.path(), "exit 3");
            let outcome = YtDlp::new(stub.path())
                .download(
                    "https://youtu.be/a1",
                    dir.path(),
                    None,
                    &[],
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(outcome, DownloadOutcome::Failed(Some(3)));
        }

        #[tokio::test]
        async fn version_reads_stdout() {
            let dir = tempdir().unwrap();
            let stub = install_stub(dir.path(), "echo 2025.10.22");
            assert_eq!(YtDlp::new(stub.path()).version().await.unwrap(), "2025.10.22");
        }

        #[tokio::test]
        async fn missing_binary_is_spawn_error() {
            let _lock = process_lock();
            let dir = tempdir().unwrap();
            let err = YtDlp::new(dir.path().join("absent"))
                .list_videos("https://example.com", None, true, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, YtDlpError::Spawn { .. }));
        }
    }
}
