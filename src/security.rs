#![forbid(unsafe_code)]

//! Startup checks for the gateway process.

use std::{fs, path::Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;
use tracing::{info, warn};

/// Fails fast when the gateway is started as root. yt-dlp runs with the
/// gateway's privileges and fetches arbitrary remote content.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFileState {
    NotConfigured,
    Missing,
    /// Readable by users other than the owner.
    Exposed,
    Ok,
}

/// Inspects the configured cookie file. Problems are logged, never fatal:
/// a missing file just means requests run without a session.
pub fn check_cookie_file(path: Option<&Path>) -> CookieFileState {
    let Some(path) = path else {
        return CookieFileState::NotConfigured;
    };
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) | Err(_) => {
            warn!(path = %path.display(), "cookie file not found; extractor runs without cookies");
            return CookieFileState::Missing;
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o044 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{:o}", mode & 0o777),
                "cookie file is readable by other users; chmod 600 is recommended"
            );
            return CookieFileState::Exposed;
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    info!(path = %path.display(), "using cookie file");
    CookieFileState::Ok
}
