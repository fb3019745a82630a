/// Health checking for the n8n stack
///
/// The health predicate combines two signals: every required compose
/// service has a running container (none stuck restarting), and the n8n
/// health endpoint answers with a 2xx status.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::HealthSettings;
use crate::core::docker::{ComposeStack, ServiceStatus};
use crate::core::process::CommandRunner;
use crate::utils::ContainerState;

#[allow(async_fn_in_trait)]
pub trait HttpProbe {
    async fn is_healthy(&self, url: &str) -> bool;
}

/// Probe backed by reqwest
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("n8n-ops/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpProbe for ReqwestProbe {
    async fn is_healthy(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                debug!(url, status = %response.status(), "health probe");
                response.status().is_success()
            }
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Observable deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Down,
    UpUnverified,
    UpHealthy,
}

impl DeploymentState {
    pub fn label(&self) -> &'static str {
        match self {
            DeploymentState::Down => "down",
            DeploymentState::UpUnverified => "up (unverified)",
            DeploymentState::UpHealthy => "up (healthy)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub services: Vec<ServiceStatus>,
    pub missing: Vec<String>,
    pub restarting: Vec<String>,
    pub endpoint_ok: bool,
    pub state: DeploymentState,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.state == DeploymentState::UpHealthy
    }

    /// Human-readable reasons the stack is not healthy
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.missing.is_empty() {
            problems.push(format!("services not running: {}", self.missing.join(", ")));
        }
        if !self.restarting.is_empty() {
            problems.push(format!("services in a restart loop: {}", self.restarting.join(", ")));
        }
        if !self.endpoint_ok {
            problems.push("health endpoint not responding".to_string());
        }
        problems
    }
}

/// Outcome of a bounded wait
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub healthy: bool,
    pub attempts: u32,
    pub report: HealthReport,
}

pub struct HealthChecker<'a, R: CommandRunner, P: HttpProbe> {
    stack: &'a ComposeStack<'a, R>,
    probe: &'a P,
    settings: &'a HealthSettings,
    required: Vec<String>,
}

impl<'a, R: CommandRunner, P: HttpProbe> HealthChecker<'a, R, P> {
    pub fn new(stack: &'a ComposeStack<'a, R>, probe: &'a P) -> Self {
        let config = stack.config();
        Self {
            stack,
            probe,
            settings: &config.health,
            required: config.required_services(),
        }
    }

    /// Evaluate the health predicate once. Read-only.
    pub async fn check(&self) -> Result<HealthReport> {
        let services = self.stack.list_services().await?;

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| {
                !services
                    .iter()
                    .any(|s| &s.service == *name && s.state.is_running())
            })
            .cloned()
            .collect();

        let mut restarting: Vec<String> = services
            .iter()
            .filter(|s| s.state == ContainerState::Restarting)
            .map(|s| s.service.clone())
            .collect();
        restarting.sort();
        restarting.dedup();

        let any_running = services.iter().any(|s| s.state.is_running());

        // The endpoint is only worth asking once the app container is up
        let endpoint_ok = if missing.is_empty() {
            self.probe.is_healthy(&self.settings.url).await
        } else {
            false
        };

        let state = if !any_running {
            DeploymentState::Down
        } else if missing.is_empty() && restarting.is_empty() && endpoint_ok {
            DeploymentState::UpHealthy
        } else {
            DeploymentState::UpUnverified
        };

        Ok(HealthReport {
            services,
            missing,
            restarting,
            endpoint_ok,
            state,
        })
    }

    /// Poll at a fixed interval until healthy or out of attempts
    pub async fn wait_until_healthy(&self) -> Result<WaitOutcome> {
        let attempts = self.settings.attempts.max(1);
        let spinner = if std::io::stdout().is_terminal() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            Some(pb)
        } else {
            None
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(pb) = &spinner {
                pb.set_message(format!("Waiting for n8n to become healthy ({}/{})", attempt, attempts));
                pb.tick();
            }

            let report = self.check().await?;
            if report.is_healthy() {
                info!(attempt, "stack healthy");
                if let Some(pb) = spinner {
                    pb.finish_and_clear();
                }
                return Ok(WaitOutcome {
                    healthy: true,
                    attempts: attempt,
                    report,
                });
            }

            if attempt >= attempts {
                warn!(attempts, problems = ?report.problems(), "stack did not become healthy");
                if let Some(pb) = spinner {
                    pb.finish_and_clear();
                }
                return Ok(WaitOutcome {
                    healthy: false,
                    attempts: attempt,
                    report,
                });
            }

            debug!(attempt, state = report.state.label(), "not healthy yet");
            tokio::time::sleep(self.settings.interval).await;
        }
    }
}
