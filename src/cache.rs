#![forbid(unsafe_code)]

//! Per-channel record of video ids that were already handled.
//!
//! Each channel gets `videoCache_<channel>.json` inside the cache directory,
//! holding a flat JSON array of ids.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::ytdlp::VideoEntry;

const CACHE_FILE_PREFIX: &str = "videoCache_";
const CACHE_FILE_EXTENSION: &str = "json";

/// Replaces characters that are not safe in file names on any platform we
/// run on. Channel names double as directory and cache file names.
pub fn sanitize_channel_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn cache_file_path(cache_dir: &Path, channel: &str) -> PathBuf {
    cache_dir.join(format!(
        "{CACHE_FILE_PREFIX}{}.{CACHE_FILE_EXTENSION}",
        sanitize_channel_name(channel)
    ))
}

#[derive(Debug)]
pub struct ProcessedCache {
    path: PathBuf,
    ids: HashSet<String>,
}

impl ProcessedCache {
    /// Loads the cache for `channel`. A missing file is a fresh channel; a
    /// file that cannot be read or parsed is logged and treated the same way.
    pub fn load(cache_dir: &Path, channel: &str) -> Self {
        let path = cache_file_path(cache_dir, channel);
        let ids = match read_ids(&path) {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(
                    channel,
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "error loading cache for channel, starting fresh"
                );
                HashSet::new()
            }
        };
        Self { path, ids }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns true when the id was not present yet.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn extend<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
    }

    /// Entries from `videos` whose id is not cached yet, in listing order and
    /// without duplicates.
    pub fn new_videos<'a>(&self, videos: &'a [VideoEntry]) -> Vec<&'a VideoEntry> {
        let mut seen = HashSet::new();
        videos
            .iter()
            .filter(|video| !self.ids.contains(&video.id))
            .filter(|video| seen.insert(video.id.as_str()))
            .collect()
    }

    /// Writes the whole set to disk through a temp file in the same
    /// directory so a crash never leaves a truncated cache behind.
    pub fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let sorted: BTreeSet<&str> = self.ids.iter().map(String::as_str).collect();
        let payload = serde_json::to_vec(&sorted).context("serializing video cache")?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(&payload)
            .with_context(|| format!("writing {}", self.path.display()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn read_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(HashSet::new());
    }
    let ids: Option<Vec<String>> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(ids.unwrap_or_default().into_iter().collect())
}
