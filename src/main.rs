#![forbid(unsafe_code)]

//! TubePulse: polls configured channels and downloads new uploads with
//! yt-dlp.
//!
//! ```text
//! tubepulse [--config <path>] [--env-file <path>] [run [--once]]
//! tubepulse check
//! tubepulse seed <channel>
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use tubepulse::cache::ProcessedCache;
use tubepulse::config::{RuntimeOverrides, resolve_runtime_config};
use tubepulse::logging::{self, LogFormat};
use tubepulse::security::ensure_not_root;
use tubepulse::settings::Settings;
use tubepulse::tool::{self, ToolLocation, ensure_ytdlp};
use tubepulse::worker::Worker;
use tubepulse::ytdlp::YtDlp;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "tubepulse",
    version,
    about = "Poll video channels and download new uploads with yt-dlp",
    long_about = None,
)]
struct Cli {
    /// Settings file (TOML). Defaults to TUBEPULSE_CONFIG or ./tubepulse.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Extra environment file read before the process environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Overrides download_path from the settings file.
    #[arg(long, global = true)]
    download_path: Option<PathBuf>,

    /// Overrides cache_path from the settings file.
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    /// Use this yt-dlp binary instead of the managed copy.
    #[arg(long, global = true)]
    ytdlp: Option<PathBuf>,

    /// Permit running as root.
    #[arg(long, global = true)]
    allow_root: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll all channels until interrupted (default).
    Run {
        /// Process every channel once and exit.
        #[arg(long)]
        once: bool,
    },

    /// Validate settings and show channels, cache sizes and the yt-dlp location.
    Check,

    /// Mark every currently listed video of a channel as processed.
    Seed {
        /// Channel name as written in the settings file.
        channel: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_env())?;
    ensure_not_root("tubepulse", cli.allow_root)?;

    let runtime = resolve_runtime_config(RuntimeOverrides {
        settings_path: cli.config,
        download_path: cli.download_path,
        cache_path: cli.cache_path,
        ytdlp_path: cli.ytdlp,
        env_path: cli.env_file,
    })?;
    let mut settings = Settings::load(&runtime.settings_path)?;
    settings.apply_overrides(&runtime);

    match cli.command.unwrap_or(Command::Run { once: false }) {
        Command::Run { once } => run(settings, once).await,
        Command::Check => check(&settings).await,
        Command::Seed { channel } => seed(settings, &channel).await,
    }
}

async fn run(settings: Settings, once: bool) -> Result<()> {
    tracing::info!("TubePulse v{VERSION} starting");

    let cancel = CancellationToken::new();
    let listener = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    tracing::info!("shutdown initiated, cleaning up");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        }
    });

    let result = async {
        let worker = Worker::bootstrap(settings, cancel.clone()).await?;
        if once {
            let report = worker.run_cycle().await;
            tracing::info!(?report, "single pass complete");
            Ok::<(), anyhow::Error>(())
        } else {
            worker.run().await
        }
    }
    .await;

    cancel.cancel();
    let _ = listener.await;

    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "fatal error");
    }
    tracing::info!("TubePulse service stopped");
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
                            std::future::pending::<()>().await;
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    }

    // Without a working Ctrl+C handler the process still dies on the signal,
    // just without saving progress first.
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

async fn check(settings: &Settings) -> Result<()> {
    settings.validate()?;

    println!("Download path: {}", settings.download_path.display());
    println!("Cache path: {}", settings.cache_path.display());
    println!(
        "Polling every {} hour(s), recent window {}",
        settings.polling_interval_hours, settings.date_after
    );
    println!();
    println!("Channels ({}):", settings.channels.len());
    for channel in &settings.channels {
        let cache = ProcessedCache::load(&settings.cache_path, &channel.name);
        println!(
            "  - {} [{}] resolution={} cached={} {}",
            channel.name,
            if channel.enabled { "enabled" } else { "disabled" },
            settings.resolution_for(channel).unwrap_or("best"),
            cache.len(),
            channel.url
        );
    }
    println!();

    let managed = tool::managed_dir();
    match tool::locate(settings.ytdlp_path.as_deref(), managed.as_deref())? {
        ToolLocation::Managed {
            path,
            present: false,
        } => {
            println!(
                "yt-dlp: {} (not downloaded yet, fetched on first run)",
                path.display()
            );
        }
        location => {
            let ytdlp = YtDlp::new(location.path());
            let version = ytdlp
                .version()
                .await
                .with_context(|| format!("running {}", location.path().display()))?;
            println!("yt-dlp: {} ({version})", location.path().display());
        }
    }

    Ok(())
}

async fn seed(settings: Settings, channel: &str) -> Result<()> {
    settings.validate()?;
    let ytdlp = ensure_ytdlp(settings.ytdlp_path.as_deref(), settings.ytdlp_nightlies).await?;
    let worker = Worker::new(settings, ytdlp, CancellationToken::new());
    let added = worker.seed_channel(channel).await?;
    println!("Added {added} video id(s) to the cache of {channel}.");
    Ok(())
}
