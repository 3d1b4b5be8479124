#![forbid(unsafe_code)]

//! Startup guard against running the service with root privileges.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when started as root. Downloads land in user-owned media
/// directories and the managed yt-dlp updates itself in place, so a root run
/// leaves root-owned files behind that a later unprivileged run cannot touch.
pub fn ensure_not_root(process: &str, allow_root: bool) -> Result<()> {
    ensure_not_root_for(Uid::current(), process, allow_root)
}

fn ensure_not_root_for(uid: Uid, process: &str, allow_root: bool) -> Result<()> {
    if uid.is_root() {
        if allow_root {
            tracing::warn!(process, "running as root because --allow-root was given");
            return Ok(());
        }
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account (or pass --allow-root)"
        );
    }
    Ok(())
}
