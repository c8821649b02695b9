//! Saved-session persistence.
//!
//! Each surviving client becomes one desktop entry in the saved-session
//! directory, keyed by its startup id. Saves stage into a sibling `.new`
//! directory and swap it in with renames, so a crash mid-save leaves either
//! the old session or the new one, never a half-written mix.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

/// Restart descriptor for one saved client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedApp {
    pub name: String,
    pub exec: String,
    pub discard_exec: Option<String>,
    pub startup_id: String,
    pub icon: String,
    pub app_type: String,
}

impl SavedApp {
    pub fn to_desktop_entry(&self) -> String {
        let mut out = String::from("[Desktop Entry]\n");
        out.push_str(&format!("Type={}\n", self.app_type));
        out.push_str(&format!("Name={}\n", self.name));
        out.push_str(&format!("Exec={}\n", self.exec));
        out.push_str(&format!("Icon={}\n", self.icon));
        out.push_str(&format!(
            "Comment=Client {} which was automatically saved\n",
            self.startup_id
        ));
        out.push_str("StartupNotify=true\n");
        out.push_str(&format!("X-Session-Startup-Id={}\n", self.startup_id));
        if let Some(discard) = &self.discard_exec {
            out.push_str(&format!("X-Session-Discard-Exec={}\n", discard));
        }
        out
    }

    fn from_desktop_entry(data: &str) -> Option<Self> {
        let mut in_entry = false;
        let mut name = None;
        let mut exec = None;
        let mut discard_exec = None;
        let mut startup_id = None;
        let mut icon = None;
        let mut app_type = None;
        for line in data.lines() {
            let line = line.trim();
            if line.starts_with('[') {
                in_entry = line == "[Desktop Entry]";
                continue;
            }
            if !in_entry {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "Name" => name = Some(value.to_string()),
                "Exec" => exec = Some(value.to_string()),
                "Icon" => icon = Some(value.to_string()),
                "Type" => app_type = Some(value.to_string()),
                "X-Session-Startup-Id" => startup_id = Some(value.to_string()),
                "X-Session-Discard-Exec" => discard_exec = Some(value.to_string()),
                _ => {}
            }
        }
        Some(Self {
            name: name?,
            exec: exec?,
            discard_exec,
            startup_id: startup_id?,
            icon: icon.unwrap_or_else(|| "system-run".to_string()),
            app_type: app_type.unwrap_or_else(|| "Application".to_string()),
        })
    }
}

/// Replaces the saved session at `dir` with `apps`.
pub fn save_session(dir: &Path, apps: &[SavedApp]) -> Result<()> {
    let staging = sibling(dir, ".new");
    let casualty = sibling(dir, ".old");

    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("clearing {}", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating {}", staging.display()))?;

    for app in apps {
        let path = staging.join(format!("{}.desktop", app.startup_id));
        fs::write(&path, app.to_desktop_entry())
            .with_context(|| format!("writing {}", path.display()))?;
    }

    if dir.exists() {
        if casualty.exists() {
            fs::remove_dir_all(&casualty)
                .with_context(|| format!("clearing {}", casualty.display()))?;
        }
        fs::rename(dir, &casualty)
            .with_context(|| format!("retiring {}", dir.display()))?;
    }
    fs::rename(&staging, dir)
        .with_context(|| format!("installing {}", dir.display()))?;

    if casualty.exists() {
        if let Err(err) = fs::remove_dir_all(&casualty) {
            warn!(
                "session_save: could not remove {}: {}",
                casualty.display(),
                err
            );
        }
    }

    debug!("session_save: saved {} clients to {}", apps.len(), dir.display());
    Ok(())
}

/// Reads the saved session back; a missing directory is an empty session.
pub fn load_session(dir: &Path) -> Result<Vec<SavedApp>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", dir.display()));
        }
    };

    let mut apps = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
            continue;
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match SavedApp::from_desktop_entry(&data) {
            Some(app) => apps.push(app),
            None => warn!(
                "session_save: skipping malformed entry {}",
                path.display()
            ),
        }
    }
    apps.sort_by(|a, b| a.startup_id.cmp(&b.startup_id));
    Ok(apps)
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "session".into());
    name.push(suffix);
    dir.with_file_name(name)
}
