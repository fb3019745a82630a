/// Helper utilities for the n8n-ops CLI

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::{AppConfig, COMPOSE_FILE, SENSITIVE_MARKERS};

/// Get the project root directory (where docker-compose.yml is located)
pub fn find_project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    // 1. Explicit --project-dir always wins, even without a compose file
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    // 2. Check environment variable
    if let Ok(project_root) = std::env::var("N8N_PROJECT_ROOT") {
        let path = PathBuf::from(project_root);
        if path.join(COMPOSE_FILE).exists() {
            return Ok(path);
        }
    }

    // 3. Check saved configuration
    if let Ok(config) = AppConfig::load() {
        if let Some(root) = config.project_root {
            let path = PathBuf::from(&root);
            if path.join(COMPOSE_FILE).exists() {
                return Ok(path);
            }
        }
    }

    // 4. Search for docker-compose.yml in current and parent directories
    let current_dir = std::env::current_dir()
        .context("Failed to get current directory")?;

    if let Some(found) = search_upwards(&current_dir, COMPOSE_FILE) {
        if let Ok(mut config) = AppConfig::load() {
            let _ = config.set_project_root(found.clone());
        }
        return Ok(found);
    }

    anyhow::bail!(
        "Could not find the n8n installation\n\n\
        Please specify the location:\n\n\
        Option 1 - Set environment variable:\n\
          export N8N_PROJECT_ROOT=/path/to/n8n\n\n\
        Option 2 - Run from the project directory:\n\
          cd /path/to/n8n && n8n-ops status\n\n\
        Option 3 - Pass it explicitly:\n\
          n8n-ops --project-dir /path/to/n8n status"
    )
}

/// Walk from `start` towards the filesystem root looking for `file_name`
pub fn search_upwards(start: &Path, file_name: &str) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        if current.join(file_name).exists() {
            return Some(current.to_path_buf());
        }
        dir = current.parent();
    }
    None
}

/// Locate an executable on PATH
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// True when running with an effective uid of root
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Compact UTC timestamp plus a random suffix, e.g. `20261017T093000Z-3fa9c1`
pub fn unique_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}-{:06x}", now.format("%Y%m%dT%H%M%SZ"), suffix)
}

/// Copy a directory tree, merging into `dest` when it already exists.
/// Links in `src` are followed; the copy holds plain files and directories.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<u64> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let metadata = fs::metadata(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;

        if metadata.is_dir() {
            copied += copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        "*".repeat(chars.len())
    } else {
        let start: String = chars[..visible_chars].iter().collect();
        let end: String = chars[chars.len() - visible_chars..].iter().collect();
        format!("{}...{}", start, end)
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    SENSITIVE_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Simplified container state as reported by `docker compose ps`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Paused,
    Restarting,
    Dead,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(status: &str) -> Self {
        let status_lower = status.to_lowercase();
        // "restarting" must be checked before the generic "up"/"running" match
        if status_lower.contains("restarting") {
            ContainerState::Restarting
        } else if status_lower.contains("paused") {
            ContainerState::Paused
        } else if status_lower.contains("running") || status_lower.starts_with("up") {
            ContainerState::Running
        } else if status_lower.contains("dead") || status_lower.contains("removing") {
            ContainerState::Dead
        } else if status_lower.contains("exited")
            || status_lower.contains("stopped")
            || status_lower.contains("created")
        {
            ContainerState::Stopped
        } else {
            ContainerState::Unknown
        }
    }
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ContainerState::Running => "Running",
            ContainerState::Stopped => "Stopped",
            ContainerState::Paused => "Paused",
            ContainerState::Restarting => "Restarting",
            ContainerState::Dead => "Dead",
            ContainerState::Unknown => "Unknown",
        }
    }
}
