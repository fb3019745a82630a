/// Backup creation and retention
///
/// One invocation produces exactly one `n8n_backup_<id>.tar.gz` in the backup
/// directory. The working directory it is assembled in is always removed,
/// whether the build succeeds or not. Upload, retention and the disk-usage
/// check run afterwards and only ever produce warnings.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::core::archive::{pack_directory, Metadata};
use crate::core::docker::ComposeStack;
use crate::core::error::OpsError;
use crate::core::lock::BackupLock;
use crate::core::process::CommandRunner;
use crate::core::storage;
use crate::core::transfer::DatabaseTransfer;
use crate::core::versions;
use crate::utils::*;

/// What a successful backup produced
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub id: String,
    pub archive: PathBuf,
    pub size: u64,
    pub metadata: Metadata,
    pub uploaded_to: Option<String>,
    pub removed: Vec<PathBuf>,
    /// Best-effort failures, already logged
    pub warnings: Vec<String>,
}

/// A file in the backup directory
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl BackupEntry {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

pub struct BackupManager<'a, R: CommandRunner> {
    stack: &'a ComposeStack<'a, R>,
}

impl<'a, R: CommandRunner> BackupManager<'a, R> {
    pub fn new(stack: &'a ComposeStack<'a, R>) -> Self {
        Self { stack }
    }

    /// Build one archive of the current state. The caller proves exclusive
    /// access to the backup directory by holding its lock.
    pub async fn create_backup(&self, _lock: &BackupLock) -> Result<BackupSummary> {
        let config = self.stack.config();
        self.check_services().await?;

        let id = unique_id(Utc::now());
        let work_dir = config.backup_dir.join(format!("{}{}", BACKUP_PREFIX, id));
        let archive = config
            .backup_dir
            .join(format!("{}{}{}", BACKUP_PREFIX, id, ARCHIVE_SUFFIX));

        fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        info!(id = %id, "creating backup");

        let built = self.build(&work_dir, &archive).await;
        if let Err(e) = fs::remove_dir_all(&work_dir) {
            warn!(path = %work_dir.display(), error = %e, "failed to remove working directory");
        }
        let (metadata, size) = built?;

        let mut summary = BackupSummary {
            id,
            archive,
            size,
            metadata,
            uploaded_to: None,
            removed: Vec::new(),
            warnings: Vec::new(),
        };
        self.finish(&mut summary).await;
        Ok(summary)
    }

    /// A local database can only be dumped while its container is up
    async fn check_services(&self) -> Result<()> {
        let config = self.stack.config();
        if !config.is_local_database() {
            return Ok(());
        }

        let service = &config.services.database;
        let running = self.stack.running_services().await?;
        if !running.contains(service) {
            return Err(OpsError::precondition(
                "backup preflight",
                format!("service '{}' is not running", service),
            )
            .with_hint(START_COMMAND)
            .into());
        }
        Ok(())
    }

    async fn build(&self, work_dir: &Path, archive: &Path) -> Result<(Metadata, u64)> {
        let config = self.stack.config();

        DatabaseTransfer::new(self.stack)
            .export(&work_dir.join(DUMP_FILE))
            .await?;

        let config_included = config.env_file.is_file();
        if config_included {
            fs::copy(&config.env_file, work_dir.join(ENV_SNAPSHOT))
                .with_context(|| format!("Failed to copy {}", config.env_file.display()))?;
        }

        let proxy_included = config.proxy_config_dir.is_dir();
        if proxy_included {
            let name = config
                .proxy_config_dir
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new(DEFAULT_PROXY_DIR));
            let files = copy_dir_recursive(&config.proxy_config_dir, &work_dir.join(name))?;
            debug!(files, "proxy configuration copied");
        }

        let metadata = Metadata {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            n8n_version: versions::detect_version(self.stack)
                .await
                .unwrap_or_else(|| "unknown".to_string()),
            database_mode: config.database.label().to_string(),
            database_included: true,
            config_included,
            proxy_included,
            restore_command: format!("{} {}", RESTORE_COMMAND, archive.display()),
        };
        fs::write(work_dir.join(METADATA_FILE), metadata.render())?;

        let size = pack_directory(work_dir, archive)?;
        info!(archive = %archive.display(), size, "backup archive created");
        Ok((metadata, size))
    }

    /// Upload, retention and disk check. Never fails the backup.
    async fn finish(&self, summary: &mut BackupSummary) {
        let config = self.stack.config();

        if let Some(target) = &config.object_storage {
            match storage::upload_archive(self.stack.runner(), target, &summary.archive).await {
                Ok(url) => summary.uploaded_to = Some(url),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "archive upload failed");
                    summary.warnings.push(format!("Upload failed, archive kept locally: {:#}", e));
                }
            }
        }

        match apply_retention(&config.backup_dir, config.retention) {
            Ok(removed) => summary.removed = removed,
            Err(e) => {
                warn!(error = %e, "retention cleanup failed");
                summary.warnings.push(format!("Retention cleanup failed: {:#}", e));
            }
        }

        if let Some(warning) = storage::check_disk_usage(&config.backup_dir, config.disk_warn_percent) {
            warn!("{}", warning);
            summary.warnings.push(warning);
        }
    }
}

/// Files in `dir` named `<prefix>*<suffix>`, newest first
fn collect_files(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<BackupEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) || !name.ends_with(suffix) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        entries.push(BackupEntry {
            path: entry.path(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    // Names embed the creation timestamp, so they break mtime ties in order
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(entries)
}

/// Local archives, newest first
pub fn list_backups(dir: &Path) -> Result<Vec<BackupEntry>> {
    collect_files(dir, BACKUP_PREFIX, ARCHIVE_SUFFIX)
}

/// Delete all but the `keep` newest matching files; returns what was removed
pub fn prune_files(dir: &Path, prefix: &str, suffix: &str, keep: usize) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in collect_files(dir, prefix, suffix)?.into_iter().skip(keep) {
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(path = %entry.path.display(), "removed by retention");
                removed.push(entry.path);
            }
            Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to remove old file"),
        }
    }
    Ok(removed)
}

/// Keep the `keep` newest archives and rollback records
pub fn apply_retention(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let keep = keep.max(1);
    let mut removed = prune_files(dir, BACKUP_PREFIX, ARCHIVE_SUFFIX, keep)?;
    removed.extend(prune_files(dir, ROLLBACK_PREFIX, ROLLBACK_SUFFIX, keep)?);
    if !removed.is_empty() {
        info!(count = removed.len(), "old backups removed");
    }
    Ok(removed)
}
