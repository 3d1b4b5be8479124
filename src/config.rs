#![forbid(unsafe_code)]

//! Environment layer that sits between the CLI flags and the TOML settings
//! file. Values come from explicit overrides first, then the process
//! environment, then a `.env` file next to the service.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SETTINGS_PATH: &str = "tubepulse.toml";

const SETTINGS_KEY: &str = "TUBEPULSE_CONFIG";
const DOWNLOAD_PATH_KEY: &str = "TUBEPULSE_DOWNLOAD_PATH";
const CACHE_PATH_KEY: &str = "TUBEPULSE_CACHE_PATH";
const YTDLP_KEY: &str = "TUBEPULSE_YTDLP";

/// Locations resolved before the settings file is parsed. The optional
/// fields replace whatever the settings file says when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub settings_path: PathBuf,
    pub download_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub settings_path: Option<PathBuf>,
    pub download_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_config(&file_vars, process_env, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let pick = |explicit: Option<PathBuf>, key: &str| {
        explicit
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(|| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from))
    };

    let settings_path = pick(overrides.settings_path, SETTINGS_KEY)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

    RuntimeConfig {
        settings_path,
        download_path: pick(overrides.download_path, DOWNLOAD_PATH_KEY),
        cache_path: pick(overrides.cache_path, CACHE_PATH_KEY),
        ytdlp_path: pick(overrides.ytdlp_path, YTDLP_KEY),
    }
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .as_deref()
        .and_then(non_blank)
        .or_else(|| file_vars.get(key).and_then(|value| non_blank(value)))
}

/// Reads a `.env` file into a map. A missing file is an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading env file {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

/// `KEY=value`, optionally prefixed with `export ` and with the value wrapped
/// in matching quotes. Comments and lines without `=` yield nothing.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let env = make_env(contents);
        let vars = read_env_file(env.path()).unwrap();
        build_runtime_config(&vars, |_| None, RuntimeOverrides::default())
    }

    #[test]
    fn defaults_to_local_settings_file() {
        let config = config_from("");
        assert_eq!(config.settings_path, PathBuf::from(DEFAULT_SETTINGS_PATH));
        assert!(config.download_path.is_none());
        assert!(config.cache_path.is_none());
        assert!(config.ytdlp_path.is_none());
    }

    #[test]
    fn reads_paths_from_env_file() {
        let config = config_from(
            "TUBEPULSE_CONFIG=\"/etc/tubepulse.toml\"\nTUBEPULSE_DOWNLOAD_PATH=/media\nTUBEPULSE_CACHE_PATH='/var/cache/tp'\n",
        );
        assert_eq!(config.settings_path, PathBuf::from("/etc/tubepulse.toml"));
        assert_eq!(config.download_path, Some(PathBuf::from("/media")));
        assert_eq!(config.cache_path, Some(PathBuf::from("/var/cache/tp")));
    }

    #[test]
    fn environment_beats_env_file() {
        let vars = read_env_file(make_env("TUBEPULSE_CACHE_PATH=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |key| (key == CACHE_PATH_KEY).then(|| "/env".to_string()),
            RuntimeOverrides::default(),
        );
        assert_eq!(config.cache_path, Some(PathBuf::from("/env")));
    }

    #[test]
    fn explicit_override_beats_environment() {
        let mut vars = HashMap::new();
        vars.insert(YTDLP_KEY.to_string(), "/file/yt-dlp".to_string());
        let config = build_runtime_config(
            &vars,
            |key| (key == YTDLP_KEY).then(|| "/env/yt-dlp".to_string()),
            RuntimeOverrides {
                ytdlp_path: Some(PathBuf::from("/cli/yt-dlp")),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(config.ytdlp_path, Some(PathBuf::from("/cli/yt-dlp")));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = config_from("TUBEPULSE_DOWNLOAD_PATH=\"   \"\nTUBEPULSE_CONFIG=\n");
        assert!(config.download_path.is_none());
        assert_eq!(config.settings_path, PathBuf::from(DEFAULT_SETTINGS_PATH));
    }

    #[test]
    fn read_env_file_handles_export_and_comments() {
        let env = make_env(
            r#"
            export TUBEPULSE_DOWNLOAD_PATH="/media"
            # comment
            INVALID_LINE
            TUBEPULSE_YTDLP = '/opt/yt-dlp'
            "#,
        );
        let vars = read_env_file(env.path()).unwrap();
        assert_eq!(vars.get("TUBEPULSE_DOWNLOAD_PATH").unwrap(), "/media");
        assert_eq!(vars.get("TUBEPULSE_YTDLP").unwrap(), "/opt/yt-dlp");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn parse_env_line_requires_matching_quotes() {
        assert_eq!(
            parse_env_line("KEY=\"half'"),
            Some(("KEY".to_string(), "\"half'".to_string()))
        );
        assert_eq!(
            parse_env_line("  KEY = 'a=b' "),
            Some(("KEY".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_env_line("# KEY=value"), None);
        assert_eq!(parse_env_line("=value"), None);
    }

    #[test]
    fn environment_blank_falls_back_to_file() {
        let mut vars = HashMap::new();
        vars.insert(DOWNLOAD_PATH_KEY.to_string(), "/file".to_string());
        let config = build_runtime_config(
            &vars,
            |_| Some("  ".to_string()),
            RuntimeOverrides::default(),
        );
        assert_eq!(config.download_path, Some(PathBuf::from("/file")));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
