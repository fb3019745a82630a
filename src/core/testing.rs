/// Test doubles shared by the core module tests

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::config::{DatabaseMode, HealthSettings, ServiceLayout, StackConfig};
use crate::core::health::HttpProbe;
use crate::core::process::{CommandOutput, CommandRunner, CommandSpec};

#[derive(Debug, Clone)]
pub struct FakeReply {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl FakeReply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Records every command and answers from substring rules (first match wins).
/// Unmatched commands succeed with empty output.
pub struct FakeRunner {
    rules: Vec<(String, FakeReply)>,
    programs: Vec<String>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            programs: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, needle: &str, reply: FakeReply) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.programs.push(program.to_string());
        self
    }

    /// A running local stack: n8n + postgres up, dumps succeed, version 1.64.0
    pub fn healthy_local_stack() -> Self {
        Self::new()
            .on("ps --all", FakeReply::ok(RUNNING_LOCAL_PS))
            .on("pg_dump", FakeReply::ok("PGDMP-fake-custom-format"))
            .on("n8n --version", FakeReply::ok("1.64.0\n"))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    pub fn called(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Index of the first call containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.call_lines().iter().position(|line| line.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.call_lines().iter().filter(|line| line.contains(needle)).count()
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let line = spec.display();
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| FakeReply::ok(""));

        let stdout = match &spec.stdout_file {
            Some(path) => {
                std::fs::write(path, &reply.stdout)?;
                String::new()
            }
            None => reply.stdout,
        };

        Ok(CommandOutput {
            success: reply.success,
            code: Some(if reply.success { 0 } else { 1 }),
            stdout,
            stderr: reply.stderr,
        })
    }

    fn has_program(&self, program: &str) -> bool {
        self.programs.iter().any(|p| p == program)
    }
}

pub const RUNNING_LOCAL_PS: &str = concat!(
    r#"{"Name":"n8n-n8n-1","Service":"n8n","State":"running","Health":"healthy"}"#,
    "\n",
    r#"{"Name":"n8n-postgres-1","Service":"postgres","State":"running","Health":"healthy"}"#
);

/// HTTP probe with a fixed answer
pub struct FakeProbe {
    healthy: bool,
    hits: AtomicUsize,
}

impl FakeProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy,
            hits: AtomicUsize::new(0),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl HttpProbe for FakeProbe {
    async fn is_healthy(&self, _url: &str) -> bool {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.healthy
    }
}

/// Project + backup directories under `root` with a `.env` and compose file
pub fn local_config(root: &Path) -> StackConfig {
    config_with(
        root,
        DatabaseMode::Local {
            user: "n8n".to_string(),
            database: "n8n".to_string(),
        },
    )
}

pub fn external_config(root: &Path) -> StackConfig {
    config_with(
        root,
        DatabaseMode::External {
            url: "postgres://n8n:pw@db.example.com:5432/n8n".to_string(),
        },
    )
}

fn config_with(root: &Path, database: DatabaseMode) -> StackConfig {
    let project_dir = root.join("project");
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(project_dir.join(".env"), "POSTGRES_USER=n8n\nPOSTGRES_PASSWORD=pw\n").unwrap();
    std::fs::write(
        project_dir.join("docker-compose.yml"),
        "services:\n  n8n:\n    image: n8nio/n8n:${N8N_VERSION:-latest}\n  postgres:\n    image: postgres:16\n",
    )
    .unwrap();

    StackConfig {
        env_file: project_dir.join(".env"),
        compose_file: project_dir.join("docker-compose.yml"),
        proxy_config_dir: project_dir.join("traefik"),
        project_dir,
        database,
        services: ServiceLayout {
            app: "n8n".to_string(),
            database: "postgres".to_string(),
            worker: "n8n-worker".to_string(),
        },
        backup_dir: root.join("backups"),
        retention: 5,
        disk_warn_percent: 100.0,
        object_storage: None,
        health: HealthSettings {
            url: "http://localhost:5678/healthz".to_string(),
            interval: Duration::from_millis(0),
            attempts: 3,
        },
    }
}
