//! Filesystem locations used by the daemon.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Per-user configuration directory, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("could not determine the user config directory")?
        .join("sessiond");
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}

/// Where the saved session's desktop entries live.
pub fn saved_session_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("saved-session"))
}

/// The shared cookie authority file.
pub fn authority_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("authority"))
}

/// Default listening socket, preferring the user runtime directory.
pub fn default_socket_path() -> Result<PathBuf> {
    let base = match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => env::temp_dir(),
    };
    let dir = base.join("sessiond");
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir.join("xsmp.sock"))
}
