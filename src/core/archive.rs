/// Backup archive format
///
/// An archive is a gzip-compressed tar of one dated directory
/// (`n8n_backup_<id>/`) holding the database dump, the `.env` snapshot, an
/// optional proxy configuration directory and `metadata.txt`. Readers never
/// rely on that directory name: both validation and extraction strip the first
/// path component and look for members directly below it. Only regular files
/// and directories are accepted.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use tracing::debug;

use crate::core::error::OpsError;
use crate::utils::{DUMP_FILE, METADATA_FILE, REQUIRED_MEMBERS};

const METADATA_TITLE: &str = "n8n Backup";

/// Key/value record written once into every archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub timestamp: String,
    pub hostname: String,
    pub n8n_version: String,
    pub database_mode: String,
    pub database_included: bool,
    pub config_included: bool,
    pub proxy_included: bool,
    pub restore_command: String,
}

impl Metadata {
    pub fn render(&self) -> String {
        let flag = |b: bool| if b { "yes" } else { "no" };
        format!(
            "{title}\n{rule}\nTimestamp: {}\nHostname: {}\nn8n Version: {}\nDatabase Mode: {}\n\
             Database Included: {}\nConfig Included: {}\nProxy Config Included: {}\nRestore Command: {}\n",
            self.timestamp,
            self.hostname,
            self.n8n_version,
            self.database_mode,
            flag(self.database_included),
            flag(self.config_included),
            flag(self.proxy_included),
            self.restore_command,
            title = METADATA_TITLE,
            rule = "=".repeat(METADATA_TITLE.len()),
        )
    }

    /// Lenient parse: unknown keys and non key/value lines are ignored
    pub fn parse(text: &str) -> Self {
        let mut meta = Metadata::default();
        let yes = |v: &str| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true");

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Timestamp" => meta.timestamp = value.to_string(),
                "Hostname" => meta.hostname = value.to_string(),
                "n8n Version" => meta.n8n_version = value.to_string(),
                "Database Mode" => meta.database_mode = value.to_string(),
                "Database Included" => meta.database_included = yes(value),
                "Config Included" => meta.config_included = yes(value),
                "Proxy Config Included" => meta.proxy_included = yes(value),
                "Restore Command" => meta.restore_command = value.to_string(),
                _ => {}
            }
        }
        meta
    }

    /// Inclusion flags, compared across a restore → backup round trip
    pub fn flags(&self) -> (bool, bool, bool) {
        (self.database_included, self.config_included, self.proxy_included)
    }
}

/// Compress `src_dir` into `archive_path`, keeping the directory name as the
/// single top-level entry. Returns the archive size in bytes.
pub fn pack_directory(src_dir: &Path, archive_path: &Path) -> Result<u64> {
    let dir_name = src_dir
        .file_name()
        .with_context(|| format!("Invalid working directory: {}", src_dir.display()))?;

    let result = (|| -> Result<()> {
        let file = File::create(archive_path)
            .with_context(|| format!("Failed to create {}", archive_path.display()))?;
        // Links are stored as their targets' contents
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(true);
        builder
            .append_dir_all(dir_name, src_dir)
            .with_context(|| format!("Failed to add {} to archive", src_dir.display()))?;
        builder.into_inner()?.finish()?.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(archive_path);
        return Err(e);
    }

    let size = fs::metadata(archive_path)?.len();
    debug!(archive = %archive_path.display(), size, "archive written");
    Ok(size)
}

/// Result of inspecting an archive without extracting it
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub exists: bool,
    pub format_error: Option<String>,
    pub members: Vec<String>,
    pub missing: Vec<String>,
    pub metadata: Option<Metadata>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.exists && self.format_error.is_none() && self.missing.is_empty()
    }

    /// One-line diagnosis
    pub fn summary(&self) -> String {
        if !self.exists {
            format!("archive not found: {}", self.path.display())
        } else if let Some(e) = &self.format_error {
            format!("archive is not a readable tar.gz: {}", e)
        } else if !self.missing.is_empty() {
            format!("archive is missing: {}", self.missing.join(", "))
        } else {
            format!("archive is valid ({} members)", self.members.len())
        }
    }

    /// Precondition error for an invalid archive, `None` if valid
    pub fn to_error(&self) -> Option<OpsError> {
        if self.is_valid() {
            return None;
        }
        Some(
            OpsError::precondition("archive validation", self.summary())
                .with_hint("List restorable archives with: n8n-ops list"),
        )
    }
}

/// Read-only structural check of an archive
pub fn validate_archive(path: &Path) -> ValidationReport {
    let mut report = ValidationReport {
        path: path.to_path_buf(),
        exists: path.is_file(),
        format_error: None,
        members: Vec::new(),
        missing: Vec::new(),
        metadata: None,
    };

    if !report.exists {
        report.missing = REQUIRED_MEMBERS.iter().map(|m| m.to_string()).collect();
        return report;
    }

    match list_members(path) {
        Ok((members, metadata)) => {
            report.members = members;
            report.metadata = metadata;
        }
        Err(e) => {
            report.format_error = Some(format!("{:#}", e));
            return report;
        }
    }

    for required in REQUIRED_MEMBERS {
        if !report.members.iter().any(|m| relative_member(Path::new(m)) == Path::new(required)) {
            report.missing.push(required.to_string());
        }
    }

    // metadata.txt must also say how to restore
    let has_restore_command = report
        .metadata
        .as_ref()
        .map_or(false, |meta| !meta.restore_command.is_empty());
    if !has_restore_command {
        report.missing.push(format!("Restore Command in {}", METADATA_FILE));
    }

    debug!(
        archive = %path.display(),
        members = report.members.len(),
        missing = ?report.missing,
        "archive inspected"
    );
    report
}

fn list_members(path: &Path) -> Result<(Vec<String>, Option<Metadata>)> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut members = Vec::new();
    let mut metadata = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_type(entry.header().entry_type(), &path)?;
        let name = path.to_string_lossy().into_owned();

        if metadata.is_none() && relative_member(&path) == Path::new(METADATA_FILE) {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .context("Failed to read metadata record")?;
            metadata = Some(Metadata::parse(&text));
        }
        members.push(name);
    }

    if members.is_empty() {
        anyhow::bail!("archive is empty");
    }
    Ok((members, metadata))
}

/// Path below the archive's top-level directory
fn relative_member(path: &Path) -> PathBuf {
    let mut components = path.components();
    components.next();
    components.as_path().to_path_buf()
}

/// Links could point outside the extraction directory and later entries would
/// be written through them
fn check_entry_type(entry_type: EntryType, path: &Path) -> Result<()> {
    match entry_type {
        EntryType::Regular | EntryType::Directory => Ok(()),
        other => anyhow::bail!("unsupported {:?} entry {}", other, path.display()),
    }
}

/// Extract into `dest`, dropping the leading directory component.
/// Entries that would escape `dest` are rejected.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    fs::create_dir_all(dest)?;

    let mut written = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_type(entry.header().entry_type(), &path)?;

        let relative = relative_member(&path);
        if relative.as_os_str().is_empty() {
            continue;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            anyhow::bail!("Refusing to extract unsafe path {}", path.display());
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("Failed to extract {}", relative.display()))?;
        written.push(relative);
    }

    if !dest.join(DUMP_FILE).is_file() {
        anyhow::bail!("{} not found after extraction", DUMP_FILE);
    }
    Ok(written)
}
