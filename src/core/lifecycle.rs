/// Lifecycle flows: backup, restore, migrate/upgrade
///
/// Every flow runs its steps strictly in order and records the stages it
/// reached. Destructive flows hold the backup-directory lock for their whole
/// duration. Each flow builds its own `ComposeStack`, so an image-tag override
/// set for an upgrade never leaks into a later flow.

use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use std::fs;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::archive::{extract_archive, validate_archive};
use crate::core::backup::{BackupManager, BackupSummary};
use crate::core::config::StackConfig;
use crate::core::docker::{ComposeStack, ServiceStatus};
use crate::core::error::OpsError;
use crate::core::health::{HealthChecker, HealthReport, HttpProbe, WaitOutcome};
use crate::core::lock::BackupLock;
use crate::core::process::CommandRunner;
use crate::core::rollback::RollbackRecord;
use crate::core::transfer::DatabaseTransfer;
use crate::core::versions;
use crate::utils::*;

/// Confirmation points in the flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Stop services for an upgrade
    Stop,
    /// Overwrite the live database and configuration
    Overwrite,
    /// Restore the pre-upgrade archive after a failed verification
    Rollback,
}

#[cfg_attr(test, mockall::automock)]
pub trait Confirm {
    fn confirm(&self, gate: Gate, question: &str) -> bool;
}

/// Interactive `[y/N]` prompt on stdin
pub struct TerminalPrompt {
    /// Pre-answer the stop and overwrite gates
    pub assume_yes: bool,
    /// Pre-answer the rollback gate
    pub rollback_on_failure: bool,
}

impl TerminalPrompt {
    /// Answer given on the command line; `--yes` never covers rollback
    fn preset(&self, gate: Gate) -> bool {
        match gate {
            Gate::Stop | Gate::Overwrite => self.assume_yes,
            Gate::Rollback => self.rollback_on_failure,
        }
    }
}

impl Confirm for TerminalPrompt {
    fn confirm(&self, gate: Gate, question: &str) -> bool {
        if self.preset(gate) {
            println!("{} {} {}", "?".cyan(), question, "yes".dimmed());
            return true;
        }

        if !std::io::stdin().is_terminal() {
            warn!(?gate, "no terminal to confirm on, treating as declined");
            return false;
        }

        print!("{} {} [y/N] ", "?".cyan(), question);
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Validated,
    Confirmed,
    ServicesStopped,
    ConfigRestored,
    DatabaseRestored,
    ServicesStarted,
    Verified,
    Unverified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStage {
    PreflightChecked,
    BackupCreated,
    Confirmed,
    ServicesStopped,
    ImagesPulled,
    ServicesStarted,
    Verified,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub stages: Vec<RestoreStage>,
    pub verified: bool,
    pub health: WaitOutcome,
    /// Copy of the configuration that was replaced
    pub safety_copy: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MigrateOutcome {
    pub stages: Vec<MigrateStage>,
    pub backup: BackupSummary,
    pub rollback_record: PathBuf,
    pub previous_version: Option<String>,
    pub current_version: Option<String>,
}

/// What `upgrade`/`migrate` move to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeTarget {
    /// Whatever image tags the compose file currently resolves to
    Current,
    /// Pin `N8N_VERSION` to this tag
    Version(String),
}

/// Post-upgrade checks
#[derive(Debug, Clone)]
pub struct Verification {
    pub health: WaitOutcome,
    pub version: Option<String>,
    pub reasons: Vec<String>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Directory removed when dropped
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

pub struct Lifecycle<'a, R: CommandRunner, P: HttpProbe, C: Confirm> {
    config: &'a StackConfig,
    runner: &'a R,
    probe: &'a P,
    prompt: &'a C,
}

impl<'a, R: CommandRunner, P: HttpProbe, C: Confirm> Lifecycle<'a, R, P, C> {
    pub fn new(config: &'a StackConfig, runner: &'a R, probe: &'a P, prompt: &'a C) -> Self {
        Self {
            config,
            runner,
            probe,
            prompt,
        }
    }

    fn stack(&self) -> ComposeStack<'a, R> {
        ComposeStack::new(self.runner, self.config)
    }

    pub async fn backup(&self) -> Result<BackupSummary> {
        let lock = BackupLock::acquire(&self.config.backup_dir)?;
        let stack = self.stack();
        BackupManager::new(&stack).create_backup(&lock).await
    }

    /// One evaluation of the health predicate
    pub async fn health(&self) -> Result<HealthReport> {
        let stack = self.stack();
        HealthChecker::new(&stack, self.probe).check().await
    }

    pub async fn status(&self) -> Result<Vec<ServiceStatus>> {
        self.stack().list_services().await
    }

    pub async fn scale(&self, count: u32) -> Result<()> {
        self.stack().scale_workers(count).await
    }

    /// Replace the live deployment with the contents of `archive`
    pub async fn restore(&self, archive: &Path) -> Result<RestoreOutcome> {
        // Read-only gate first: an unusable archive never takes the lock
        if let Some(err) = validate_archive(archive).to_error() {
            return Err(err.into());
        }
        let _lock = BackupLock::acquire(&self.config.backup_dir)?;
        let stack = self.stack();
        self.restore_locked(&stack, archive, true).await
    }

    async fn restore_locked(
        &self,
        stack: &ComposeStack<'_, R>,
        archive: &Path,
        ask: bool,
    ) -> Result<RestoreOutcome> {
        let mut stages = Vec::new();

        let report = validate_archive(archive);
        if let Some(err) = report.to_error() {
            return Err(err.into());
        }
        stages.push(RestoreStage::Validated);
        info!(archive = %archive.display(), "archive validated");

        if ask {
            let question = format!(
                "Restore {}? This replaces the current n8n database and configuration.",
                archive.display()
            );
            if !self.prompt.confirm(Gate::Overwrite, &question) {
                return Err(OpsError::Aborted { step: "restore confirmation" }.into());
            }
        }
        stages.push(RestoreStage::Confirmed);

        // Extraction only touches the scratch directory, so it runs while
        // services are still up
        let id = unique_id(Utc::now());
        let scratch = ScratchDir::create(self.config.backup_dir.join(format!(".restore-{}", id)))?;
        extract_archive(archive, scratch.path())
            .map_err(|e| OpsError::transport("archive extraction", format!("{:#}", e)))?;

        stack.stop_all().await?;
        stages.push(RestoreStage::ServicesStopped);

        let safety_copy = self.restore_config(scratch.path(), &id)?;
        stages.push(RestoreStage::ConfigRestored);

        let transfer = DatabaseTransfer::new(stack);
        if self.config.is_local_database() {
            stack.start_service(&self.config.services.database).await?;
            transfer.wait_for_database().await?;
        }
        transfer.import(&scratch.path().join(DUMP_FILE)).await?;
        stages.push(RestoreStage::DatabaseRestored);
        drop(scratch);

        stack.start_all().await?;
        stages.push(RestoreStage::ServicesStarted);

        let health = HealthChecker::new(stack, self.probe).wait_until_healthy().await?;
        let verified = health.healthy;
        stages.push(if verified {
            RestoreStage::Verified
        } else {
            RestoreStage::Unverified
        });
        info!(verified, "restore finished");

        Ok(RestoreOutcome {
            stages,
            verified,
            health,
            safety_copy,
        })
    }

    /// Put the archived `.env` and proxy directory in place. The replaced
    /// `.env` is kept next to it as `.env.pre-restore-<id>`.
    fn restore_config(&self, extracted: &Path, id: &str) -> Result<Option<PathBuf>> {
        let mut safety_copy = None;

        let snapshot = extracted.join(ENV_SNAPSHOT);
        if snapshot.is_file() {
            let env_file = &self.config.env_file;
            if env_file.is_file() {
                let name = env_file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| ENV_FILE.to_string());
                let copy = env_file.with_file_name(format!("{}.pre-restore-{}", name, id));
                fs::copy(env_file, &copy)
                    .with_context(|| format!("Failed to keep a copy of {}", env_file.display()))?;
                safety_copy = Some(copy);
            }
            fs::copy(&snapshot, env_file)
                .with_context(|| format!("Failed to restore {}", env_file.display()))?;
        } else {
            warn!("archive has no configuration snapshot, keeping current .env");
        }

        if let Some(name) = self.config.proxy_config_dir.file_name() {
            let archived = extracted.join(name);
            if archived.is_dir() {
                copy_dir_recursive(&archived, &self.config.proxy_config_dir)?;
            }
        }

        Ok(safety_copy)
    }

    /// Back up, move to `target`, verify, and offer rollback on failure
    pub async fn migrate(&self, target: &UpgradeTarget) -> Result<MigrateOutcome> {
        let lock = BackupLock::acquire(&self.config.backup_dir)?;
        let mut stack = self.stack();
        let mut stages = Vec::new();

        let previous_version = self.preflight(&stack).await?;
        stages.push(MigrateStage::PreflightChecked);

        let backup = BackupManager::new(&stack).create_backup(&lock).await?;
        stages.push(MigrateStage::BackupCreated);

        let target_version = match target {
            UpgradeTarget::Current => None,
            UpgradeTarget::Version(v) => Some(v.clone()),
        };
        let record = RollbackRecord::new(&backup.archive, previous_version.clone(), target_version.clone());
        let record_path = record.save(&self.config.backup_dir, &backup.id)?;

        let question = match &target_version {
            Some(v) => format!("Stop all services and move n8n to {}?", v),
            None => "Stop all services and upgrade to the latest configured images?".to_string(),
        };
        if !self.prompt.confirm(Gate::Stop, &question) {
            return Err(OpsError::Aborted { step: "upgrade confirmation" }.into());
        }
        stages.push(MigrateStage::Confirmed);

        if let Some(v) = &target_version {
            stack.set_override(VERSION_OVERRIDE_VAR, v.as_str());
        }

        stack.stop_all().await?;
        stages.push(MigrateStage::ServicesStopped);

        // A failed pull leaves everything stopped; the hint says how to start again
        stack.pull_images().await?;
        stages.push(MigrateStage::ImagesPulled);

        stack.start_all().await?;
        stages.push(MigrateStage::ServicesStarted);

        let verification = self.verify(&stack, target_version.as_deref()).await?;
        if verification.passed() {
            stages.push(MigrateStage::Verified);
            info!(version = ?verification.version, "upgrade verified");
            return Ok(MigrateOutcome {
                stages,
                backup,
                rollback_record: record_path,
                previous_version,
                current_version: verification.version,
            });
        }

        warn!(reasons = ?verification.reasons, "upgrade verification failed");
        let question = format!(
            "Upgrade verification failed ({}). Restore the pre-upgrade backup?",
            verification.reasons.join("; ")
        );
        if !self.prompt.confirm(Gate::Rollback, &question) {
            return Err(OpsError::VerificationFailed {
                step: "upgrade verification",
                reasons: verification.reasons,
                hint: Some(format!(
                    "Services were left on the new version. Roll back with: {} {}",
                    RESTORE_COMMAND,
                    backup.archive.display()
                )),
            }
            .into());
        }

        self.rollback(&record_path).await
    }

    async fn preflight(&self, stack: &ComposeStack<'_, R>) -> Result<Option<String>> {
        stack.check_available().await?;

        if !self.config.compose_file.is_file() {
            return Err(OpsError::precondition(
                "upgrade preflight",
                format!("{} not found", self.config.compose_file.display()),
            )
            .into());
        }

        let running = stack.running_services().await?;
        let missing: Vec<String> = self
            .config
            .required_services()
            .into_iter()
            .filter(|s| !running.contains(s))
            .collect();
        if !missing.is_empty() {
            return Err(OpsError::precondition(
                "upgrade preflight",
                format!("services not running: {}", missing.join(", ")),
            )
            .with_hint(START_COMMAND)
            .into());
        }

        let version = versions::detect_version(stack).await;
        info!(version = ?version, "preflight passed");
        Ok(version)
    }

    /// Health wait, version detection and target match
    pub async fn verify(&self, stack: &ComposeStack<'_, R>, target: Option<&str>) -> Result<Verification> {
        let health = HealthChecker::new(stack, self.probe).wait_until_healthy().await?;
        let mut reasons = if health.healthy {
            Vec::new()
        } else {
            health.report.problems()
        };

        let version = versions::detect_version(stack).await;
        match (&version, target) {
            (None, _) => reasons.push("n8n version could not be detected".to_string()),
            (Some(v), Some(t)) if !versions::matches_target(v, t) => {
                reasons.push(format!("n8n reports {} instead of {}", v, t))
            }
            _ => {}
        }

        Ok(Verification {
            health,
            version,
            reasons,
        })
    }

    /// Restore the archive a rollback record points to, on the previous images
    async fn rollback(&self, record_path: &Path) -> Result<MigrateOutcome> {
        let record = RollbackRecord::load(record_path)?;
        info!(archive = %record.archive_path.display(), "rolling back");

        let mut stack = self.stack();
        if let Some(previous) = &record.previous_version {
            stack.set_override(VERSION_OVERRIDE_VAR, previous.as_str());
        }

        let restored = self.restore_locked(&stack, &record.archive_path, false).await?;
        Err(OpsError::RolledBack {
            archive: record.archive_path,
            verified: restored.verified,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::Metadata;
    use crate::core::testing::{local_config, FakeProbe, FakeReply, FakeRunner};

    fn answering(stop_and_overwrite: bool, rollback: bool) -> MockConfirm {
        let mut prompt = MockConfirm::new();
        prompt.expect_confirm().returning(move |gate, _| match gate {
            Gate::Stop | Gate::Overwrite => stop_and_overwrite,
            Gate::Rollback => rollback,
        });
        prompt
    }

    async fn make_backup(config: &StackConfig) -> BackupSummary {
        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let prompt = MockConfirm::new();
        Lifecycle::new(config, &runner, &probe, &prompt).backup().await.unwrap()
    }

    fn ops(err: &anyhow::Error) -> &OpsError {
        err.downcast_ref::<OpsError>().unwrap()
    }

    #[tokio::test]
    async fn test_restore_refuses_archive_without_dump() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());

        let work = dir.path().join("n8n_backup_manual");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join(METADATA_FILE), "Restore Command: sudo n8n-ops restore x\n").unwrap();
        fs::write(work.join(ENV_SNAPSHOT), "A=1\n").unwrap();
        let archive = dir.path().join("n8n_backup_manual.tar.gz");
        crate::core::archive::pack_directory(&work, &archive).unwrap();

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let mut prompt = MockConfirm::new();
        prompt.expect_confirm().never();

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .restore(&archive)
            .await
            .unwrap_err();
        assert_eq!(ops(&err).exit_code(), 2);
        assert!(err.to_string().contains(DUMP_FILE));
        assert!(runner.calls().is_empty());
        assert_eq!(fs::read_to_string(&config.env_file).unwrap(), "POSTGRES_USER=n8n\nPOSTGRES_PASSWORD=pw\n");
    }

    #[tokio::test]
    async fn test_restore_declined_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let backup = make_backup(&config).await;

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let prompt = answering(false, false);

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .restore(&backup.archive)
            .await
            .unwrap_err();
        assert_eq!(ops(&err).exit_code(), 130);
        assert!(!runner.called("down"));
    }

    #[tokio::test]
    async fn test_restore_runs_to_verified() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let backup = make_backup(&config).await;
        fs::write(&config.env_file, "POSTGRES_USER=changed\n").unwrap();

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let mut prompt = MockConfirm::new();
        prompt
            .expect_confirm()
            .withf(|gate, _| *gate == Gate::Overwrite)
            .times(1)
            .return_const(true);

        let outcome = Lifecycle::new(&config, &runner, &probe, &prompt)
            .restore(&backup.archive)
            .await
            .unwrap();

        assert!(outcome.verified);
        assert_eq!(
            outcome.stages,
            vec![
                RestoreStage::Validated,
                RestoreStage::Confirmed,
                RestoreStage::ServicesStopped,
                RestoreStage::ConfigRestored,
                RestoreStage::DatabaseRestored,
                RestoreStage::ServicesStarted,
                RestoreStage::Verified,
            ]
        );

        let down = runner.position(" down").unwrap();
        let db_up = runner.position("up -d postgres").unwrap();
        let drop = runner.position("DROP DATABASE").unwrap();
        let restore = runner.position("pg_restore").unwrap();
        assert!(down < db_up && db_up < drop && drop < restore);
        assert!(runner.called("pg_isready"));

        assert_eq!(
            fs::read_to_string(&config.env_file).unwrap(),
            "POSTGRES_USER=n8n\nPOSTGRES_PASSWORD=pw\n"
        );
        let copy = outcome.safety_copy.unwrap();
        assert_eq!(fs::read_to_string(copy).unwrap(), "POSTGRES_USER=changed\n");
        assert!(backup.archive.exists());
    }

    #[tokio::test]
    async fn test_restore_unhealthy_is_unverified() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let backup = make_backup(&config).await;

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(false);
        let prompt = answering(true, false);

        let outcome = Lifecycle::new(&config, &runner, &probe, &prompt)
            .restore(&backup.archive)
            .await
            .unwrap();
        assert!(!outcome.verified);
        assert_eq!(outcome.stages.last(), Some(&RestoreStage::Unverified));
    }

    #[tokio::test]
    async fn test_restore_then_backup_keeps_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        fs::create_dir_all(&config.proxy_config_dir).unwrap();
        fs::write(config.proxy_config_dir.join("traefik.yml"), "entryPoints: {}\n").unwrap();
        let original = make_backup(&config).await;

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let prompt = answering(true, false);
        let lifecycle = Lifecycle::new(&config, &runner, &probe, &prompt);

        lifecycle.restore(&original.archive).await.unwrap();
        let again = lifecycle.backup().await.unwrap();

        let reread = validate_archive(&again.archive).metadata.unwrap();
        assert_eq!(reread.flags(), original.metadata.flags());
        assert_eq!(
            Metadata::parse(&again.metadata.render()).flags(),
            (true, true, true)
        );
    }

    #[tokio::test]
    async fn test_migrate_pull_failure_leaves_services_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::healthy_local_stack().on(" pull", FakeReply::fail("manifest unknown"));
        let probe = FakeProbe::new(true);
        let prompt = answering(true, false);

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .migrate(&UpgradeTarget::Version("9.9.9".to_string()))
            .await
            .unwrap_err();

        let ops = ops(&err);
        assert_eq!(ops.step(), "image pull");
        assert_ne!(ops.exit_code(), 0);
        assert!(ops.hint().unwrap().contains(START_COMMAND));
        assert!(runner.called(" down"));
        assert!(!runner.called("up -d"));

        let pull = &runner.calls()[runner.position(" pull").unwrap()];
        assert!(pull.envs.contains(&(VERSION_OVERRIDE_VAR.to_string(), "9.9.9".to_string())));
    }

    #[tokio::test]
    async fn test_migrate_declined_rollback_keeps_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(false);
        let prompt = answering(true, false);

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .migrate(&UpgradeTarget::Current)
            .await
            .unwrap_err();

        match ops(&err) {
            OpsError::VerificationFailed { reasons, hint, .. } => {
                assert!(reasons.iter().any(|r| r.contains("health endpoint")));
                assert!(hint.as_deref().unwrap().contains(RESTORE_COMMAND));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_ne!(ops(&err).exit_code(), 0);

        let archives = crate::core::backup::list_backups(&config.backup_dir).unwrap();
        assert_eq!(archives.len(), 1);
        let name = archives[0].name();
        let id = name.trim_start_matches(BACKUP_PREFIX).trim_end_matches(ARCHIVE_SUFFIX);
        let record = RollbackRecord::load(&config.backup_dir.join(RollbackRecord::file_name(id))).unwrap();
        assert_eq!(record.archive_path, archives[0].path);
        assert_eq!(runner.count(" down"), 1);
        assert!(!runner.called("pg_restore"));
    }

    #[tokio::test]
    async fn test_migrate_rolls_back_to_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        // The stack keeps reporting 1.64.0, so the 1.65.0 target never verifies
        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let prompt = answering(true, true);

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .migrate(&UpgradeTarget::Version("1.65.0".to_string()))
            .await
            .unwrap_err();

        match ops(&err) {
            OpsError::RolledBack { archive, verified } => {
                assert!(archive.exists());
                assert!(*verified);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(runner.count(" down"), 2);
        assert!(runner.called("pg_restore"));

        let calls = runner.calls();
        let last_start = calls.iter().rev().find(|c| c.display().ends_with("up -d")).unwrap();
        assert!(last_start
            .envs
            .contains(&(VERSION_OVERRIDE_VAR.to_string(), "1.64.0".to_string())));
    }

    #[tokio::test]
    async fn test_upgrade_verified() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let mut prompt = MockConfirm::new();
        prompt
            .expect_confirm()
            .withf(|gate, _| *gate == Gate::Stop)
            .times(1)
            .return_const(true);

        let outcome = Lifecycle::new(&config, &runner, &probe, &prompt)
            .migrate(&UpgradeTarget::Current)
            .await
            .unwrap();

        assert_eq!(outcome.stages.last(), Some(&MigrateStage::Verified));
        assert_eq!(outcome.stages.len(), 7);
        assert_eq!(outcome.current_version.as_deref(), Some("1.64.0"));
        assert!(outcome.rollback_record.exists());
        assert!(outcome.backup.archive.exists());
        assert!(runner.calls().iter().all(|c| c.envs.is_empty()));
    }

    #[tokio::test]
    async fn test_migrate_preflight_requires_running_services() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::new();
        let probe = FakeProbe::new(true);
        let mut prompt = MockConfirm::new();
        prompt.expect_confirm().never();

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .migrate(&UpgradeTarget::Current)
            .await
            .unwrap_err();
        assert_eq!(ops(&err).exit_code(), 2);
        assert!(crate::core::backup::list_backups(&config.backup_dir).unwrap().is_empty());
        assert!(!runner.called(" down"));
    }

    #[tokio::test]
    async fn test_second_flow_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let _held = BackupLock::acquire(&config.backup_dir).unwrap();

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let prompt = MockConfirm::new();
        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .backup()
            .await
            .unwrap_err();
        assert_eq!(ops(&err).step(), "lock");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_declined_stop_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let mut prompt = MockConfirm::new();
        prompt
            .expect_confirm()
            .withf(|gate, _| *gate == Gate::Stop)
            .times(1)
            .return_const(false);

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .migrate(&UpgradeTarget::Version("1.65.0".to_string()))
            .await
            .unwrap_err();

        assert_eq!(ops(&err).exit_code(), 130);
        assert!(!runner.called(" down"));
        assert!(!runner.called(" pull"));
        let archives = crate::core::backup::list_backups(&config.backup_dir).unwrap();
        assert_eq!(archives.len(), 1);
        assert!(validate_archive(&archives[0].path).is_valid());
    }

    #[tokio::test]
    async fn test_restore_extraction_failure_keeps_services_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());

        // Passes validation, but `traefik` is both a file and a directory
        let archive = dir.path().join("n8n_backup_clash.tar.gz");
        {
            let metadata = "Restore Command: sudo n8n-ops restore x\n";
            let members: [(&str, &[u8]); 4] = [
                ("top/database.dump", b"PGDMP"),
                ("top/metadata.txt", metadata.as_bytes()),
                ("top/traefik", b"not a directory"),
                ("top/traefik/traefik.yml", b"entryPoints: {}\n"),
            ];
            let file = fs::File::create(&archive).unwrap();
            let mut builder =
                tar::Builder::new(flate2::write::GzEncoder::new(file, flate2::Compression::default()));
            for (name, data) in members {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                builder.append_data(&mut header, name, data).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }
        assert!(validate_archive(&archive).is_valid());

        let runner = FakeRunner::healthy_local_stack();
        let probe = FakeProbe::new(true);
        let prompt = answering(true, false);

        let err = Lifecycle::new(&config, &runner, &probe, &prompt)
            .restore(&archive)
            .await
            .unwrap_err();
        assert_eq!(ops(&err).step(), "archive extraction");
        assert!(!runner.called(" down"));
        assert!(!runner.called("pg_restore"));
        assert_eq!(
            fs::read_to_string(&config.env_file).unwrap(),
            "POSTGRES_USER=n8n\nPOSTGRES_PASSWORD=pw\n"
        );
    }

    #[test]
    fn test_yes_never_answers_rollback() {
        let yes_only = TerminalPrompt {
            assume_yes: true,
            rollback_on_failure: false,
        };
        assert!(yes_only.preset(Gate::Stop));
        assert!(yes_only.preset(Gate::Overwrite));
        assert!(!yes_only.preset(Gate::Rollback));

        let rollback_only = TerminalPrompt {
            assume_yes: false,
            rollback_on_failure: true,
        };
        assert!(!rollback_only.preset(Gate::Stop));
        assert!(!rollback_only.preset(Gate::Overwrite));
        assert!(rollback_only.preset(Gate::Rollback));
    }
}
