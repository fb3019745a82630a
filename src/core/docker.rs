/// Docker Compose integration
///
/// Wraps the `docker compose` CLI for the project directory. All calls go
/// through a `CommandRunner`, and image-tag overrides (used by `migrate`)
/// are injected into the environment of every compose invocation.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::core::config::StackConfig;
use crate::core::process::{run_checked, CommandRunner, CommandSpec};
use crate::utils::{ContainerState, START_COMMAND};

/// One container as reported by `docker compose ps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub service: String,
    pub state: ContainerState,
    pub health: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(default)]
    name: String,
    service: String,
    state: String,
    #[serde(default)]
    health: String,
}

impl From<PsEntry> for ServiceStatus {
    fn from(entry: PsEntry) -> Self {
        ServiceStatus {
            name: entry.name,
            service: entry.service,
            state: entry.state.as_str().into(),
            health: Some(entry.health).filter(|h| !h.is_empty()),
        }
    }
}

/// Parse `docker compose ps --format json`.
///
/// Compose < 2.21 prints one JSON array, newer releases print one object per line.
pub fn parse_ps_output(output: &str) -> Result<Vec<ServiceStatus>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<PsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Failed to parse docker compose ps output")?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse docker compose ps line"))
            .collect::<Result<_>>()?
    };

    Ok(entries.into_iter().map(ServiceStatus::from).collect())
}

pub struct ComposeStack<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a StackConfig,
    overrides: Vec<(String, String)>,
}

impl<'a, R: CommandRunner> ComposeStack<'a, R> {
    pub fn new(runner: &'a R, config: &'a StackConfig) -> Self {
        Self {
            runner,
            config,
            overrides: Vec::new(),
        }
    }

    /// Pass `key=value` to every compose invocation (e.g. `N8N_VERSION`)
    pub fn set_override(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.overrides.retain(|(k, _)| *k != key);
        self.overrides.push((key, value.into()));
    }

    pub fn runner(&self) -> &'a R {
        self.runner
    }

    pub fn config(&self) -> &'a StackConfig {
        self.config
    }

    /// Build a `docker compose` invocation for this project
    pub fn compose_spec(&self, args: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new("docker")
            .arg("compose")
            .arg("--project-directory")
            .arg(self.config.project_dir.to_string_lossy())
            .arg("-f")
            .arg(self.config.compose_file.to_string_lossy())
            .args(args.iter().copied())
            .current_dir(&self.config.project_dir);

        for (key, value) in &self.overrides {
            spec = spec.env(key.as_str(), value.as_str());
        }
        spec
    }

    /// `docker compose exec -T <service> <command...>`
    pub fn exec_spec(&self, service: &str, command: &[&str]) -> CommandSpec {
        let mut args = vec!["exec", "-T", service];
        args.extend_from_slice(command);
        self.compose_spec(&args)
    }

    /// One-off container of `service` running `command` in place of its
    /// entrypoint. Works whether or not the service is up.
    pub fn run_spec(&self, service: &str, command: &[&str]) -> CommandSpec {
        let mut args = vec!["run", "--rm", "--no-deps", "-T"];
        match command.split_first() {
            Some((program, rest)) => {
                args.extend(["--entrypoint", *program, service]);
                args.extend_from_slice(rest);
            }
            None => args.push(service),
        }
        self.compose_spec(&args)
    }

    /// Execute a compose command, failing on non-zero exit
    pub async fn compose_command(&self, args: &[&str], step: &'static str, hint: Option<&str>) -> Result<String> {
        let output = run_checked(self.runner, &self.compose_spec(args), step, hint).await?;
        Ok(output.stdout)
    }

    /// Check that the compose plugin answers at all
    pub async fn check_available(&self) -> Result<()> {
        self.compose_command(
            &["version"],
            "docker compose check",
            Some("Install Docker with the compose plugin and make sure the daemon is running"),
        )
        .await?;
        Ok(())
    }

    /// All containers of the project, running or not
    pub async fn list_services(&self) -> Result<Vec<ServiceStatus>> {
        let stdout = self
            .compose_command(&["ps", "--all", "--format", "json"], "service listing", None)
            .await?;
        parse_ps_output(&stdout)
    }

    /// Names of services with at least one running container
    pub async fn running_services(&self) -> Result<Vec<String>> {
        let mut running: Vec<String> = self
            .list_services()
            .await?
            .into_iter()
            .filter(|s| s.state.is_running())
            .map(|s| s.service)
            .collect();
        running.sort();
        running.dedup();
        Ok(running)
    }

    /// Stop and remove all containers of the project
    pub async fn stop_all(&self) -> Result<()> {
        info!("stopping all services");
        self.compose_command(&["down"], "service stop", Some(START_COMMAND)).await?;
        Ok(())
    }

    /// Start all services in the background
    pub async fn start_all(&self) -> Result<()> {
        info!("starting all services");
        self.compose_command(
            &["up", "-d"],
            "service start",
            Some("Inspect the failure with: docker compose logs --tail 100"),
        )
        .await?;
        Ok(())
    }

    /// Start a single service (and its dependencies)
    pub async fn start_service(&self, service: &str) -> Result<()> {
        info!(service, "starting service");
        self.compose_command(&["up", "-d", service], "service start", None).await?;
        Ok(())
    }

    /// Pull images for all services
    pub async fn pull_images(&self) -> Result<()> {
        info!("pulling images");
        self.compose_command(
            &["pull"],
            "image pull",
            Some("Services are stopped. Bring them back on the current images with: docker compose up -d"),
        )
        .await?;
        Ok(())
    }

    /// Scale the stateless worker service; replica tracking stays with compose
    pub async fn scale_workers(&self, count: u32) -> Result<()> {
        let worker = self.config.services.worker.as_str();
        let scale = format!("{}={}", worker, count);
        info!(worker, count, "scaling workers");
        self.compose_command(
            &["up", "-d", "--no-recreate", "--scale", &scale, worker],
            "worker scaling",
            None,
        )
        .await?;
        Ok(())
    }
}
