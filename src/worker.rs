#![forbid(unsafe_code)]

//! The poll loop: walk every channel, seed caches on first sight, download
//! whatever is new, then sleep until the next cycle.

use anyhow::{Context, Result};
use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::cache::ProcessedCache;
use crate::settings::{Channel, Settings};
use crate::tool::{ensure_ytdlp, update_ytdlp};
use crate::ytdlp::{DownloadOutcome, VideoEntry, YtDlp, YtDlpError};

/// Counters for one pass over the channel list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub channels_checked: usize,
    pub channels_skipped: usize,
    pub channels_seeded: usize,
    pub channel_errors: usize,
    pub downloaded: usize,
    pub failed: usize,
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<YtDlpError>(), Some(YtDlpError::Cancelled))
}

pub struct Worker {
    settings: Settings,
    ytdlp: YtDlp,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(settings: Settings, ytdlp: YtDlp, cancel: CancellationToken) -> Self {
        Self {
            settings,
            ytdlp,
            cancel,
        }
    }

    /// Validates settings, makes sure yt-dlp is installed and current, and
    /// returns a worker ready to poll.
    pub async fn bootstrap(settings: Settings, cancel: CancellationToken) -> Result<Self> {
        settings.validate()?;

        let ytdlp = ensure_ytdlp(settings.ytdlp_path.as_deref(), settings.ytdlp_nightlies)
            .await
            .context("preparing yt-dlp")?;
        match ytdlp.version().await {
            Ok(version) => {
                tracing::info!(path = %ytdlp.path().display(), version = %version, "using yt-dlp")
            }
            Err(err) => tracing::warn!(error = %err, "could not determine yt-dlp version"),
        }
        if settings.ytdlp_auto_update
            && let Err(err) = update_ytdlp(&ytdlp, settings.ytdlp_nightlies).await
        {
            tracing::warn!(error = %format!("{err:#}"), "yt-dlp update failed");
        }

        Ok(Self::new(settings, ytdlp, cancel))
    }

    /// Polls until cancelled.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            channels = self.settings.channels.len(),
            enabled = self.settings.enabled_channels().count(),
            "beginning processing"
        );

        while !self.cancel.is_cancelled() {
            let report = self.run_cycle().await;
            if self.cancel.is_cancelled() {
                break;
            }

            let interval = self.settings.polling_interval();
            let now = Local::now();
            let next_check = chrono::Duration::from_std(interval)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            tracing::info!(
                completed_at = %now.format("%H:%M:%S"),
                next_check = %next_check,
                downloaded = report.downloaded,
                failed = report.failed,
                errors = report.channel_errors,
                "cycle complete, waiting before next check"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => break,
            }

            if self.settings.ytdlp_auto_update
                && let Err(err) = update_ytdlp(&self.ytdlp, self.settings.ytdlp_nightlies).await
            {
                tracing::warn!(error = %format!("{err:#}"), "yt-dlp update failed");
            }
        }

        Ok(())
    }

    /// One pass over every configured channel. Per-channel failures are
    /// logged and counted; cancellation ends the pass early.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        for channel in &self.settings.channels {
            if self.cancel.is_cancelled() {
                tracing::info!("shutdown requested, stopping channel processing");
                break;
            }

            if !channel.enabled {
                tracing::info!(channel = %channel.name, "channel is disabled, skipping");
                report.channels_skipped += 1;
                continue;
            }

            tracing::info!(channel = %channel.name, url = %channel.url, "processing channel");
            report.channels_checked += 1;

            if let Err(err) = self.process_channel(channel, &mut report).await {
                if is_cancelled(&err) {
                    break;
                }
                report.channel_errors += 1;
                tracing::error!(
                    channel = %channel.name,
                    error = %format!("{err:#}"),
                    "channel processing failed"
                );
            }
        }

        report
    }

    async fn process_channel(&self, channel: &Channel, report: &mut CycleReport) -> Result<()> {
        let mut cache = ProcessedCache::load(&self.settings.cache_path, &channel.name);

        if cache.is_empty() {
            tracing::info!(
                channel = %channel.name,
                "first run for channel, fetching all existing videos and caching them"
            );
            self.seed(channel, &mut cache).await?;
            report.channels_seeded += 1;
        } else {
            tracing::info!(channel = %channel.name, cached = cache.len(), "loaded cached video ids");
        }

        self.download_new(channel, &mut cache, report).await
    }

    /// Marks every currently listed video as processed without downloading.
    async fn seed(&self, channel: &Channel, cache: &mut ProcessedCache) -> Result<usize> {
        let videos = self
            .ytdlp
            .list_videos(&channel.url, None, self.settings.skip_shorts, &self.cancel)
            .await?;
        let before = cache.len();
        cache.extend(videos.into_iter().map(|video| video.id));
        persist(cache, &channel.name);
        tracing::info!(channel = %channel.name, cached = cache.len(), "cached video ids for channel");
        Ok(cache.len() - before)
    }

    /// Re-seeds one channel by name, adding every listed id to its cache.
    /// Returns how many ids were new.
    pub async fn seed_channel(&self, name: &str) -> Result<usize> {
        let channel = self
            .settings
            .find_channel(name)
            .with_context(|| format!("no channel named {name} in settings"))?;
        let mut cache = ProcessedCache::load(&self.settings.cache_path, &channel.name);
        self.seed(channel, &mut cache).await
    }

    async fn download_new(
        &self,
        channel: &Channel,
        cache: &mut ProcessedCache,
        report: &mut CycleReport,
    ) -> Result<()> {
        let recent = self
            .ytdlp
            .list_videos(
                &channel.url,
                Some(&self.settings.date_after),
                self.settings.skip_shorts,
                &self.cancel,
            )
            .await?;
        let fresh: Vec<VideoEntry> = cache.new_videos(&recent).into_iter().cloned().collect();

        if fresh.is_empty() {
            tracing::info!(channel = %channel.name, "no new videos found");
            return Ok(());
        }
        tracing::info!(channel = %channel.name, count = fresh.len(), "found new videos to download");
        if let Some(description) = self.settings.sleep_description() {
            tracing::info!("{description}");
        }

        let dir = self.settings.channel_download_dir(channel);
        let resolution = self.settings.resolution_for(channel);
        let sleep_args = self.settings.sleep_args();

        for video in fresh {
            if self.cancel.is_cancelled() {
                tracing::info!(channel = %channel.name, "shutdown requested during download, saving progress");
                persist(cache, &channel.name);
                return Err(YtDlpError::Cancelled.into());
            }

            let outcome = match self
                .ytdlp
                .download(&video.url, &dir, resolution, &sleep_args, &self.cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(YtDlpError::Cancelled) => {
                    tracing::info!(id = %video.id, "download interrupted by shutdown request");
                    persist(cache, &channel.name);
                    return Err(YtDlpError::Cancelled.into());
                }
                Err(err) => return Err(err.into()),
            };

            match outcome {
                DownloadOutcome::Completed => report.downloaded += 1,
                DownloadOutcome::Failed(_) => report.failed += 1,
            }
            // Failed downloads are marked too; yt-dlp exits non-zero for
            // members-only or removed videos that would fail every cycle.
            cache.insert(video.id);
            persist(cache, &channel.name);
        }

        Ok(())
    }
}

fn persist(cache: &ProcessedCache, channel: &str) {
    if let Err(err) = cache.save() {
        tracing::error!(
            channel,
            path = %cache.path().display(),
            error = %format!("{err:#}"),
            "error saving cache for channel"
        );
    }
}
