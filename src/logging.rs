#![forbid(unsafe_code)]

//! Log setup for the service binary.
//!
//! `RUST_LOG` controls the filter (default `tubepulse=info`).
//! `TUBEPULSE_LOG_FORMAT=json` switches to one JSON object per line, which is
//! what journald and container log collectors want.

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FORMAT_VAR: &str = "TUBEPULSE_LOG_FORMAT";
const DEFAULT_FILTER: &str = "tubepulse=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(LOG_FORMAT_VAR).ok().as_deref())
    }
}

pub fn init(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .map_err(|err| anyhow!("invalid log filter: {err}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    result.map_err(|err| anyhow!("installing log subscriber: {err}"))
}
