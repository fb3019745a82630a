/// Archive upload and disk usage
///
/// Uploads go through the `aws` CLI so any S3-compatible endpoint works.
/// Both concerns are best effort: failures become warnings on the backup
/// summary.

use anyhow::{Context, Result};
use std::path::Path;
use sysinfo::Disks;
use tracing::{debug, info};

use crate::core::config::ObjectStorage;
use crate::core::process::{run_checked, CommandRunner, CommandSpec};

/// Usage of the partition holding a path
#[derive(Debug, Clone)]
pub struct DiskUsage {
    pub filesystem: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: f64,
    pub mount_point: String,
}

/// Object key for an archive: `<prefix>/<file name>`
pub fn object_url(storage: &ObjectStorage, archive: &Path) -> Result<String> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid archive name: {}", archive.display()))?;

    Ok(match &storage.prefix {
        Some(prefix) if !prefix.is_empty() => format!("s3://{}/{}/{}", storage.bucket, prefix, name),
        _ => format!("s3://{}/{}", storage.bucket, name),
    })
}

/// Copy an archive to object storage with the AWS CLI
pub async fn upload_archive<R: CommandRunner>(
    runner: &R,
    storage: &ObjectStorage,
    archive: &Path,
) -> Result<String> {
    if !runner.has_program("aws") {
        anyhow::bail!("aws CLI not found in PATH");
    }

    let url = object_url(storage, archive)?;
    let mut spec = CommandSpec::new("aws")
        .args(["s3", "cp", "--only-show-errors"])
        .arg(archive.to_string_lossy())
        .arg(url.as_str());
    if let Some(endpoint) = &storage.endpoint_url {
        spec = spec.args(["--endpoint-url", endpoint.as_str()]);
    }
    for (key, value) in &storage.credentials {
        spec = spec.env(key.as_str(), value.as_str());
    }

    info!(url = %url, "uploading archive");
    run_checked(runner, &spec, "archive upload", None).await?;
    Ok(url)
}

/// Usage of the partition whose mount point is the longest prefix of `path`
pub fn partition_usage(path: &Path) -> Option<DiskUsage> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            let used = total.saturating_sub(available);
            DiskUsage {
                filesystem: disk.name().to_string_lossy().to_string(),
                total_bytes: total,
                used_bytes: used,
                available_bytes: available,
                use_percent: percent(used, total),
                mount_point: disk.mount_point().to_string_lossy().to_string(),
            }
        })
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Warning text when the backup partition is above `threshold` percent
pub fn check_disk_usage(path: &Path, threshold: f64) -> Option<String> {
    let usage = partition_usage(path)?;
    debug!(mount = %usage.mount_point, percent = usage.use_percent, "backup partition usage");
    usage_warning(&usage, threshold)
}

fn usage_warning(usage: &DiskUsage, threshold: f64) -> Option<String> {
    if usage.use_percent < threshold {
        return None;
    }
    Some(format!(
        "Backup partition {} is {:.0}% full ({} free)",
        usage.mount_point,
        usage.use_percent,
        crate::utils::format_bytes(usage.available_bytes)
    ))
}
