#![forbid(unsafe_code)]

//! The TOML settings file: global paths, throttling knobs and the channel
//! list the poll loop walks through.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::sanitize_channel_name;
use crate::config::RuntimeConfig;

pub const DEFAULT_POLLING_INTERVAL_HOURS: u64 = 1;
pub const DEFAULT_SLEEP_INTERVAL: u64 = 6;
pub const DEFAULT_DATE_AFTER: &str = "today-1day";
const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    tubepulse: Settings,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Channel {
    pub name: String,
    pub url: String,
    #[serde(default, deserialize_with = "deserialize_resolution")]
    pub download_resolution: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub download_path: PathBuf,
    #[serde(default)]
    pub cache_path: PathBuf,
    #[serde(default = "default_polling_interval_hours")]
    pub polling_interval_hours: u64,
    #[serde(default, deserialize_with = "deserialize_resolution")]
    pub download_resolution: Option<String>,
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval: u64,
    #[serde(default)]
    pub max_sleep_interval: u64,
    #[serde(default)]
    pub ytdlp_nightlies: bool,
    #[serde(default = "default_true")]
    pub ytdlp_auto_update: bool,
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,
    #[serde(default = "default_date_after")]
    pub date_after: String,
    #[serde(default = "default_true")]
    pub skip_shorts: bool,
}

fn default_true() -> bool {
    true
}

fn default_polling_interval_hours() -> u64 {
    DEFAULT_POLLING_INTERVAL_HOURS
}

fn default_sleep_interval() -> u64 {
    DEFAULT_SLEEP_INTERVAL
}

fn default_date_after() -> String {
    DEFAULT_DATE_AFTER.to_string()
}

/// Resolutions are usually written as `"1080"` but a bare `1080` is just as
/// natural in TOML, so accept both. Blank strings mean "no preference".
fn deserialize_resolution<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawResolution {
        Text(String),
        Number(u32),
    }

    let raw = Option::<RawResolution>::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawResolution::Text(text)) => {
            let trimmed = text.trim().trim_end_matches('p');
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Some(RawResolution::Number(value)) => Some(value.to_string()),
        None => None,
    })
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing settings file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(raw)?;
        Ok(file.tubepulse)
    }

    /// Paths resolved from flags or the environment win over the file.
    pub fn apply_overrides(&mut self, runtime: &RuntimeConfig) {
        if let Some(path) = &runtime.download_path {
            self.download_path = path.clone();
        }
        if let Some(path) = &runtime.cache_path {
            self.cache_path = path.clone();
        }
        if let Some(path) = &runtime.ytdlp_path {
            self.ytdlp_path = Some(path.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if is_blank(&self.download_path) || is_blank(&self.cache_path) {
            bail!("download_path and cache_path must be specified in the settings file");
        }

        let mut seen = HashSet::new();
        for (index, channel) in self.channels.iter().enumerate() {
            if channel.name.trim().is_empty() {
                bail!("channel #{} has an empty name", index + 1);
            }
            if channel.url.trim().is_empty() {
                bail!("channel {} has an empty url", channel.name);
            }
            // Names that differ only in case or in sanitized characters would
            // share a cache file on some filesystems and confuse `find_channel`.
            if !seen.insert(sanitize_channel_name(&channel.name).to_lowercase()) {
                bail!("channel name {} is used more than once", channel.name);
            }
        }

        if self.date_after.trim().is_empty() {
            bail!("date_after must not be empty");
        }

        Ok(())
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|channel| channel.enabled)
    }

    pub fn resolution_for<'a>(&'a self, channel: &'a Channel) -> Option<&'a str> {
        channel
            .download_resolution
            .as_deref()
            .or(self.download_resolution.as_deref())
    }

    /// yt-dlp throttling flags passed along with every download.
    pub fn sleep_args(&self) -> Vec<String> {
        let min = self.sleep_interval;
        let max = self.max_sleep_interval;

        if min == 0 && max == 0 {
            return Vec::new();
        }

        let mut args = vec!["--sleep-interval".to_string(), min.to_string()];
        if max > min {
            args.push("--max-sleep-interval".to_string());
            args.push(max.to_string());
        }
        args
    }

    pub fn sleep_description(&self) -> Option<String> {
        let min = self.sleep_interval;
        let max = self.max_sleep_interval;
        if min == 0 && max == 0 {
            None
        } else if max > min {
            Some(format!(
                "randomly sleeping between {min}-{max} seconds to avoid rate limiting"
            ))
        } else {
            Some(format!(
                "sleeping for {min} seconds between downloads to avoid rate limiting"
            ))
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_hours.saturating_mul(3600))
            .max(MIN_POLLING_INTERVAL)
    }

    pub fn channel_download_dir(&self, channel: &Channel) -> PathBuf {
        self.download_path.join(sanitize_channel_name(&channel.name))
    }

    pub fn find_channel(&self, name: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|channel| channel.name.eq_ignore_ascii_case(name.trim()))
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}
