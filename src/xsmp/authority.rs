//! Cookie authority file shared with session clients.
//!
//! The daemon mints one random cookie per run and records it in an authority
//! file that clients read to authenticate their `Hello`. The file may be
//! shared with other session daemons, so edits are scoped: we only ever add
//! or remove entries carrying our own network id, under an exclusive lock.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fs2::FileExt;
use log::{debug, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const AUTH_NAME: &str = "MIT-MAGIC-COOKIE-1";

/// One line of the authority file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    /// "ICE" or "XSMP"; both are written for each network id.
    pub protocol: String,
    pub network_id: String,
    pub auth_name: String,
    /// Cookie bytes, base64.
    pub auth_data: String,
}

/// Returns a fresh 16-byte cookie, base64-encoded.
pub fn generate_cookie() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// The daemon's view of the authority file: its own network id and cookie.
pub struct Authority {
    path: PathBuf,
    network_id: String,
    cookie: String,
}

impl Authority {
    pub fn new(path: PathBuf, network_id: String) -> Self {
        Self {
            path,
            network_id,
            cookie: generate_cookie(),
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn verify(&self, presented: &str) -> bool {
        presented == self.cookie
    }

    /// Writes ICE and XSMP entries for our network id, replacing any stale
    /// entries a crashed previous run left for the same id.
    pub fn install(&self) -> Result<()> {
        debug!(
            "Authority: installing entries for {} in {}",
            self.network_id,
            self.path.display()
        );
        self.rewrite(|kept| {
            for protocol in ["ICE", "XSMP"] {
                kept.push(
                    serde_json::to_string(&AuthEntry {
                        protocol: protocol.to_string(),
                        network_id: self.network_id.clone(),
                        auth_name: AUTH_NAME.to_string(),
                        auth_data: self.cookie.clone(),
                    })
                    .context("serializing authority entry")?,
                );
            }
            Ok(())
        })
    }

    /// Drops our entries, leaving everyone else's untouched.
    pub fn remove(&self) -> Result<()> {
        debug!(
            "Authority: removing entries for {} from {}",
            self.network_id,
            self.path.display()
        );
        self.rewrite(|_kept| Ok(()))
    }

    /// Read-modify-write under the lock. `append` receives the surviving
    /// lines (foreign entries and anything unparseable, kept verbatim) and
    /// may push new ones; the result lands via a temp file and rename.
    fn rewrite(&self, append: impl FnOnce(&mut Vec<String>) -> Result<()>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let _lock = AuthorityLock::acquire(&self.path)?;

        let mut kept = Vec::new();
        match File::open(&self.path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line
                        .with_context(|| format!("reading {}", self.path.display()))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AuthEntry>(&line) {
                        Ok(entry) if entry.network_id == self.network_id => {}
                        Ok(_) => kept.push(line),
                        Err(err) => {
                            warn!(
                                "Authority: keeping unparseable line in {}: {}",
                                self.path.display(),
                                err
                            );
                            kept.push(line);
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("opening {}", self.path.display()));
            }
        }

        append(&mut kept)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            for line in &kept {
                writeln!(out, "{}", line)
                    .with_context(|| format!("writing {}", tmp.display()))?;
            }
            out.sync_all()
                .with_context(|| format!("syncing {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

/// Exclusive advisory lock on `<authority>.lock`, released on drop.
struct AuthorityLock {
    file: File,
}

impl AuthorityLock {
    fn acquire(authority_path: &Path) -> Result<Self> {
        let lock_path = lock_path_for(authority_path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for AuthorityLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path_for(authority_path: &Path) -> PathBuf {
    let mut name = authority_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "authority".into());
    name.push(".lock");
    authority_path.with_file_name(name)
}
