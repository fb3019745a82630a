/// Rollback records
///
/// A record links one migration attempt to the archive taken right before it.
/// It is read only when the attempt fails verification and is never deleted
/// after success; count-based retention prunes old records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::utils::{ROLLBACK_PREFIX, ROLLBACK_SUFFIX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub timestamp: DateTime<Utc>,
    pub archive_path: PathBuf,
    pub previous_version: Option<String>,
    pub target_version: Option<String>,
}

impl RollbackRecord {
    pub fn new(archive_path: &Path, previous_version: Option<String>, target_version: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            archive_path: archive_path.to_path_buf(),
            previous_version,
            target_version,
        }
    }

    pub fn file_name(id: &str) -> String {
        format!("{}{}{}", ROLLBACK_PREFIX, id, ROLLBACK_SUFFIX)
    }

    /// Write `rollback_<id>.json` into `dir`
    pub fn save(&self, dir: &Path, id: &str) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(id));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), "rollback record written");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}
