mod cli;

use anyhow::Result;
use clap::Parser;
use colored::*;
use std::path::Path;
use std::process::ExitCode;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use n8n_ops::core::archive::validate_archive;
use n8n_ops::core::backup::{list_backups, BackupSummary};
use n8n_ops::core::health::DeploymentState;
use n8n_ops::core::versions::describe_change;
use n8n_ops::core::{
    ConfigManager, Lifecycle, OpsError, ReqwestProbe, StackConfig, SystemRunner, TerminalPrompt,
    UpgradeTarget,
};
use n8n_ops::utils::*;

type Ops<'a> = Lifecycle<'a, SystemRunner, ReqwestProbe, TerminalPrompt>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => report_error(&e),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,n8n_ops={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Step, message and corrective command; the exit code follows the error kind
fn report_error(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<OpsError>() {
        Some(ops) => {
            eprintln!("{} {}", "✗".red(), ops);
            if let Some(hint) = ops.hint() {
                eprintln!("  {} {}", "→".cyan(), hint);
            }
            ExitCode::from(ops.exit_code())
        }
        None => {
            eprintln!("{} {:#}", "✗".red(), err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        project_dir,
        env_file,
        command,
        ..
    } = cli;

    let privileged = matches!(
        command,
        Commands::Restore { .. } | Commands::Migrate { .. } | Commands::Upgrade { .. }
    );
    if privileged && !is_elevated() {
        return Err(OpsError::precondition("privilege check", "this command must run as root")
            .with_hint("Re-run it with sudo")
            .into());
    }

    if let Commands::Verify { archive } = &command {
        return handle_verify(archive);
    }

    let project_dir = find_project_root(project_dir.as_deref())
        .map_err(|e| OpsError::precondition("project discovery", format!("{:#}", e)))?;

    if let Commands::Config = command {
        return handle_config(&project_dir, env_file.as_deref());
    }

    // Read once; every flow below works from this snapshot
    let config = StackConfig::load(&project_dir, env_file.as_deref())?;
    let runner = SystemRunner;
    let probe = ReqwestProbe::new()?;
    let make_prompt = |assume_yes: bool, rollback_on_failure: bool| TerminalPrompt {
        assume_yes,
        rollback_on_failure,
    };

    match command {
        Commands::Backup => {
            let prompt = make_prompt(false, false);
            handle_backup(&Lifecycle::new(&config, &runner, &probe, &prompt)).await
        }
        Commands::Restore { archive, yes } => {
            let prompt = make_prompt(yes, false);
            handle_restore(&Lifecycle::new(&config, &runner, &probe, &prompt), &archive).await
        }
        Commands::Migrate {
            target,
            yes,
            rollback_on_failure,
        } => {
            let prompt = make_prompt(yes, rollback_on_failure);
            let ops = Lifecycle::new(&config, &runner, &probe, &prompt);
            handle_migrate(&ops, UpgradeTarget::Version(target)).await
        }
        Commands::Upgrade {
            yes,
            rollback_on_failure,
        } => {
            let prompt = make_prompt(yes, rollback_on_failure);
            let ops = Lifecycle::new(&config, &runner, &probe, &prompt);
            handle_migrate(&ops, UpgradeTarget::Current).await
        }
        Commands::Health => {
            let prompt = make_prompt(false, false);
            handle_health(&Lifecycle::new(&config, &runner, &probe, &prompt)).await
        }
        Commands::Scale { count } => {
            let prompt = make_prompt(false, false);
            let ops = Lifecycle::new(&config, &runner, &probe, &prompt);
            ops.scale(count).await?;
            println!("{} Scaled {} to {} replica(s)", "✓".green(), config.services.worker, count);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let prompt = make_prompt(false, false);
            handle_status(&Lifecycle::new(&config, &runner, &probe, &prompt)).await
        }
        Commands::List => handle_list(&config.backup_dir),
        // Handled before the configuration is loaded
        Commands::Verify { .. } | Commands::Config => Ok(ExitCode::SUCCESS),
    }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("{} {}", "⚠".yellow(), warning.yellow());
    }
}

fn print_backup_summary(summary: &BackupSummary) {
    let yes_no = |b: bool| if b { "included" } else { "not present" };
    println!(
        "{} Backup created: {} ({})",
        "✓".green(),
        summary.archive.display(),
        format_bytes(summary.size)
    );
    println!("  n8n version:   {}", summary.metadata.n8n_version);
    println!("  Database:      {} ({})", yes_no(summary.metadata.database_included), summary.metadata.database_mode);
    println!("  Config:        {}", yes_no(summary.metadata.config_included));
    println!("  Proxy config:  {}", yes_no(summary.metadata.proxy_included));
    if let Some(url) = &summary.uploaded_to {
        println!("  Uploaded to:   {}", url);
    }
    if !summary.removed.is_empty() {
        println!("  Removed {} old file(s) by retention", summary.removed.len());
    }
    print_warnings(&summary.warnings);
}

async fn handle_backup(ops: &Ops<'_>) -> Result<ExitCode> {
    println!("Creating backup...\n");
    let summary = ops.backup().await?;
    print_backup_summary(&summary);
    Ok(ExitCode::SUCCESS)
}

async fn handle_restore(ops: &Ops<'_>, archive: &Path) -> Result<ExitCode> {
    let outcome = ops.restore(archive).await?;

    if let Some(copy) = &outcome.safety_copy {
        println!("  Previous configuration kept at {}", copy.display());
    }
    if outcome.verified {
        println!("{} Restore complete, n8n is healthy", "✓".green());
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} Restore finished but n8n did not become healthy after {} checks",
        "⚠".yellow(),
        outcome.health.attempts
    );
    for problem in outcome.health.report.problems() {
        println!("  - {}", problem);
    }
    println!("\nInspect the services with: docker compose logs --tail 100");
    Ok(ExitCode::FAILURE)
}

async fn handle_migrate(ops: &Ops<'_>, target: UpgradeTarget) -> Result<ExitCode> {
    match &target {
        UpgradeTarget::Version(v) => println!("Migrating n8n to {}...\n", v),
        UpgradeTarget::Current => println!("Upgrading n8n...\n"),
    }

    let outcome = ops.migrate(&target).await?;
    print_backup_summary(&outcome.backup);
    println!(
        "{} n8n {}",
        "✓".green(),
        describe_change(outcome.previous_version.as_deref(), outcome.current_version.as_deref())
    );
    println!("  Rollback record: {}", outcome.rollback_record.display());
    Ok(ExitCode::SUCCESS)
}

async fn handle_health(ops: &Ops<'_>) -> Result<ExitCode> {
    let report = ops.health().await?;

    println!("n8n Health\n");
    println!("{:<30} {:<20} {:<12} {:<10}", "Container", "Service", "State", "Health");
    println!("{}", "-".repeat(75));
    for service in &report.services {
        println!(
            "{:<30} {:<20} {:<12} {:<10}",
            service.name,
            service.service,
            service.state.label(),
            service.health.as_deref().unwrap_or("N/A")
        );
    }
    println!();

    let state = match report.state {
        DeploymentState::UpHealthy => report.state.label().green(),
        DeploymentState::UpUnverified => report.state.label().yellow(),
        DeploymentState::Down => report.state.label().red(),
    };
    println!("Deployment: {}", state);

    if report.is_healthy() {
        println!("{} All checks passed", "✓".green());
        Ok(ExitCode::SUCCESS)
    } else {
        for problem in report.problems() {
            println!("{} {}", "✗".red(), problem);
        }
        Ok(ExitCode::FAILURE)
    }
}

async fn handle_status(ops: &Ops<'_>) -> Result<ExitCode> {
    let services = ops.status().await?;

    println!("n8n Stack Status\n");
    println!("{:<30} {:<20} {:<12} {:<10}", "Container", "Service", "State", "Health");
    println!("{}", "-".repeat(75));
    for service in services {
        println!(
            "{:<30} {:<20} {:<12} {:<10}",
            service.name,
            service.service,
            service.state.label(),
            service.health.as_deref().unwrap_or("N/A")
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_list(backup_dir: &Path) -> Result<ExitCode> {
    let backups = list_backups(backup_dir)?;
    if backups.is_empty() {
        println!("No backups in {}", backup_dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    println!("Backups in {}\n", backup_dir.display());
    println!("{:<50} {:>10} {:>12}", "Archive", "Size", "Age");
    println!("{}", "-".repeat(74));
    let now = SystemTime::now();
    for backup in &backups {
        let age = now
            .duration_since(backup.modified)
            .map(|d| format_duration(d.as_secs()))
            .unwrap_or_else(|_| "-".to_string());
        println!("{:<50} {:>10} {:>12}", backup.name(), format_bytes(backup.size), age);
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_verify(archive: &Path) -> Result<ExitCode> {
    let report = validate_archive(archive);

    println!("Archive: {}", archive.display());
    if !report.members.is_empty() {
        println!("  Members: {}", report.members.len());
    }
    if let Some(meta) = &report.metadata {
        println!("  Created:      {}", meta.timestamp);
        println!("  Host:         {}", meta.hostname);
        println!("  n8n version:  {}", meta.n8n_version);
        println!("  Database:     {}", meta.database_mode);
    }

    match report.to_error() {
        None => {
            println!("{} {}", "✓".green(), report.summary());
            Ok(ExitCode::SUCCESS)
        }
        Some(err) => Err(err.into()),
    }
}

fn handle_config(project_dir: &Path, env_file: Option<&Path>) -> Result<ExitCode> {
    let env_path = env_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project_dir.join(ENV_FILE));
    let manager = ConfigManager::load(&env_path)?;

    println!("Configuration ({}):\n", env_path.display());
    for key in manager.keys() {
        if let Some(value) = manager.display_value(&key) {
            println!("{}: {}", key, value);
        }
    }
    println!();

    let errors = manager.validate();
    if !errors.is_empty() {
        println!("{} Configuration errors:", "✗".red());
        for error in errors {
            println!("  - {}", error);
        }
        return Ok(ExitCode::from(2));
    }

    let config = StackConfig::from_manager(project_dir, &manager)?;
    println!("{} Configuration is valid", "✓".green());
    println!("  Database mode:     {}", config.database.label());
    println!("  Backup directory:  {}", config.backup_dir.display());
    println!("  Retention:         {}", config.retention);
    println!("  Required services: {}", config.required_services().join(", "));
    match config.declared_services() {
        Ok(declared) => println!("  Compose services:  {}", declared.join(", ")),
        Err(e) => println!("{} {:#}", "⚠".yellow(), e),
    }
    Ok(ExitCode::SUCCESS)
}
