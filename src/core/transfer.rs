/// Database export and import
///
/// Dumps are Postgres custom-format (`pg_dump -Fc`) and always travel through
/// the transport's stdin/stdout, so the same code path works for a database
/// container, a local client, the running n8n container, or a one-off n8n
/// container when the stack is down.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::config::DatabaseMode;
use crate::core::docker::ComposeStack;
use crate::core::error::OpsError;
use crate::core::process::{run_checked, CommandRunner, CommandSpec};

const DUMP_FLAGS: &[&str] = &["-Fc", "--clean", "--if-exists", "--no-owner"];
const READY_ATTEMPTS: u32 = 30;

/// How the dump/restore client reaches the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Client inside the compose database service
    LocalContainer,
    /// Client installed on this host, talking to the external database
    ExternalClient,
    /// Client in the running n8n container, talking to the external database
    ExternalViaRunningApp,
    /// Client in a one-off n8n container, talking to the external database
    ExternalViaContainer,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::LocalContainer => "database container",
            Transport::ExternalClient => "local client",
            Transport::ExternalViaRunningApp => "n8n container",
            Transport::ExternalViaContainer => "one-off n8n container",
        }
    }
}

pub struct DatabaseTransfer<'a, R: CommandRunner> {
    stack: &'a ComposeStack<'a, R>,
    ready_interval: Duration,
}

impl<'a, R: CommandRunner> DatabaseTransfer<'a, R> {
    pub fn new(stack: &'a ComposeStack<'a, R>) -> Self {
        Self {
            stack,
            ready_interval: Duration::from_secs(2),
        }
    }

    pub fn with_ready_interval(mut self, interval: Duration) -> Self {
        self.ready_interval = interval;
        self
    }

    /// Pick the transport for `tool` (`pg_dump` or `pg_restore`). Without a
    /// local client this is a one-off container, which works while the stack
    /// is stopped.
    pub fn transport(&self, tool: &str) -> Transport {
        match self.stack.config().database {
            DatabaseMode::Local { .. } => Transport::LocalContainer,
            DatabaseMode::External { .. } if self.stack.runner().has_program(tool) => Transport::ExternalClient,
            DatabaseMode::External { .. } => Transport::ExternalViaContainer,
        }
    }

    /// Export transport: prefers the running n8n container over a one-off one
    async fn export_transport(&self) -> Transport {
        match self.transport("pg_dump") {
            Transport::ExternalViaContainer if self.app_running().await => Transport::ExternalViaRunningApp,
            other => other,
        }
    }

    async fn app_running(&self) -> bool {
        let app = &self.stack.config().services.app;
        match self.stack.running_services().await {
            Ok(running) => running.contains(app),
            Err(e) => {
                debug!(error = %e, "could not list services");
                false
            }
        }
    }

    fn client_spec(&self, transport: Transport, command: &[&str]) -> CommandSpec {
        let services = &self.stack.config().services;
        match transport {
            Transport::LocalContainer => self.stack.exec_spec(&services.database, command),
            Transport::ExternalViaRunningApp => self.stack.exec_spec(&services.app, command),
            Transport::ExternalViaContainer => self.stack.run_spec(&services.app, command),
            Transport::ExternalClient => CommandSpec::new(command[0]).args(command[1..].iter().copied()),
        }
    }

    /// Write a custom-format dump of the live database to `dump_path`
    pub async fn export(&self, dump_path: &Path) -> Result<Transport> {
        let transport = self.export_transport().await;
        let mut command: Vec<&str> = vec!["pg_dump"];
        match &self.stack.config().database {
            DatabaseMode::Local { user, database } => {
                command.extend(["-U", user.as_str(), "-d", database.as_str()]);
            }
            DatabaseMode::External { url } => command.extend(["--dbname", url.as_str()]),
        }
        command.extend_from_slice(DUMP_FLAGS);

        info!(transport = transport.label(), "exporting database");
        let spec = self.client_spec(transport, &command).stdout_file(dump_path);
        run_checked(
            self.stack.runner(),
            &spec,
            "database export",
            Some("Check the database logs with: docker compose logs --tail 50"),
        )
        .await?;

        let size = std::fs::metadata(dump_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(OpsError::transport("database export", "pg_dump produced an empty dump").into());
        }
        debug!(size, "database exported");
        Ok(transport)
    }

    /// Poll `pg_isready` in the database container
    pub async fn wait_for_database(&self) -> Result<()> {
        let DatabaseMode::Local { user, database } = &self.stack.config().database else {
            return Ok(());
        };
        let spec = self.client_spec(
            Transport::LocalContainer,
            &["pg_isready", "-U", user.as_str(), "-d", database.as_str()],
        );

        for attempt in 1..=READY_ATTEMPTS {
            let output = self.stack.runner().run(&spec).await?;
            if output.success {
                debug!(attempt, "database accepting connections");
                return Ok(());
            }
            tokio::time::sleep(self.ready_interval).await;
        }

        Err(OpsError::transport("database start", "database did not accept connections in time")
            .with_hint("Inspect the database with: docker compose logs --tail 50")
            .into())
    }

    /// Replace the live database with the contents of `dump_path`
    pub async fn import(&self, dump_path: &Path) -> Result<Transport> {
        let transport = self.transport("pg_restore");
        let hint = "Services are partly stopped. Retry the restore or start them with: docker compose up -d";

        let command: Vec<String> = match &self.stack.config().database {
            DatabaseMode::Local { user, database } => {
                self.recreate_database(user, database, hint).await?;
                vec![
                    "pg_restore".into(),
                    "-U".into(),
                    user.clone(),
                    "-d".into(),
                    database.clone(),
                    "--no-owner".into(),
                ]
            }
            DatabaseMode::External { url } => vec![
                "pg_restore".into(),
                "--clean".into(),
                "--if-exists".into(),
                "--no-owner".into(),
                "--dbname".into(),
                url.clone(),
            ],
        };

        info!(transport = transport.label(), "importing database");
        let command: Vec<&str> = command.iter().map(String::as_str).collect();
        let spec = self.client_spec(transport, &command).stdin_file(dump_path);
        run_checked(self.stack.runner(), &spec, "database import", Some(hint)).await?;
        Ok(transport)
    }

    /// Drop and recreate the local database, disconnecting other sessions first
    async fn recreate_database(&self, user: &str, database: &str, hint: &str) -> Result<()> {
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = {} AND pid <> pg_backend_pid();",
            quote_literal(database)
        );
        let drop = format!("DROP DATABASE IF EXISTS {};", quote_ident(database));
        let create = format!("CREATE DATABASE {} OWNER {};", quote_ident(database), quote_ident(user));

        let spec = self.client_spec(
            Transport::LocalContainer,
            &[
                "psql", "-U", user, "-d", "postgres", "-v", "ON_ERROR_STOP=1",
                "-c", terminate.as_str(), "-c", drop.as_str(), "-c", create.as_str(),
            ],
        );
        debug!(database, "recreating database");
        run_checked(self.stack.runner(), &spec, "database recreate", Some(hint)).await?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{external_config, local_config, FakeReply, FakeRunner, RUNNING_LOCAL_PS};

    #[tokio::test]
    async fn test_local_export_runs_in_database_container() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::healthy_local_stack();
        let stack = ComposeStack::new(&runner, &config);
        let dump = dir.path().join("database.dump");

        let transport = DatabaseTransfer::new(&stack).export(&dump).await.unwrap();
        assert_eq!(transport, Transport::LocalContainer);
        assert!(runner.called("exec -T postgres pg_dump -U n8n -d n8n -Fc --clean --if-exists --no-owner"));
        assert_eq!(std::fs::read_to_string(&dump).unwrap(), "PGDMP-fake-custom-format");
    }

    #[tokio::test]
    async fn test_external_export_prefers_local_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = external_config(dir.path());
        let dump = dir.path().join("database.dump");

        let runner = FakeRunner::new()
            .with_program("pg_dump")
            .on("pg_dump", FakeReply::ok("PGDMP"));
        let stack = ComposeStack::new(&runner, &config);
        let transport = DatabaseTransfer::new(&stack).export(&dump).await.unwrap();
        assert_eq!(transport, Transport::ExternalClient);
        assert!(runner.call_lines()[0].starts_with("pg_dump --dbname postgres://"));

        let runner = FakeRunner::new().on("pg_dump", FakeReply::ok("PGDMP"));
        let stack = ComposeStack::new(&runner, &config);
        let transport = DatabaseTransfer::new(&stack).export(&dump).await.unwrap();
        assert_eq!(transport, Transport::ExternalViaContainer);
        assert!(runner.called("run --rm --no-deps -T --entrypoint pg_dump n8n --dbname"));
    }

    #[tokio::test]
    async fn test_external_export_uses_running_app_container() {
        let dir = tempfile::tempdir().unwrap();
        let config = external_config(dir.path());
        let dump = dir.path().join("database.dump");

        let runner = FakeRunner::new()
            .on("ps --all", FakeReply::ok(RUNNING_LOCAL_PS))
            .on("pg_dump", FakeReply::ok("PGDMP"));
        let stack = ComposeStack::new(&runner, &config);
        let transport = DatabaseTransfer::new(&stack).export(&dump).await.unwrap();

        assert_eq!(transport, Transport::ExternalViaRunningApp);
        assert!(runner.called("exec -T n8n pg_dump --dbname postgres://"));
        assert!(!runner.called(" run "));
    }

    #[tokio::test]
    async fn test_export_failure_and_empty_dump() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let dump = dir.path().join("database.dump");

        let runner = FakeRunner::new().on("pg_dump", FakeReply::fail("role \"n8n\" does not exist"));
        let stack = ComposeStack::new(&runner, &config);
        let err = DatabaseTransfer::new(&stack).export(&dump).await.unwrap_err();
        let ops = err.downcast_ref::<OpsError>().unwrap();
        assert_eq!(ops.step(), "database export");
        assert!(ops.to_string().contains("role"));

        let runner = FakeRunner::new();
        let stack = ComposeStack::new(&runner, &config);
        assert!(DatabaseTransfer::new(&stack).export(&dump).await.is_err());
    }

    #[tokio::test]
    async fn test_local_import_recreates_then_restores() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::new();
        let stack = ComposeStack::new(&runner, &config);
        let dump = dir.path().join("database.dump");
        std::fs::write(&dump, "PGDMP").unwrap();

        DatabaseTransfer::new(&stack).import(&dump).await.unwrap();

        let drop = runner.position("DROP DATABASE IF EXISTS \"n8n\"").unwrap();
        let restore = runner.position("pg_restore -U n8n -d n8n --no-owner").unwrap();
        assert!(drop < restore);
        assert!(runner.called("CREATE DATABASE \"n8n\" OWNER \"n8n\""));
        assert_eq!(runner.calls()[restore].stdin_file.as_deref(), Some(dump.as_path()));
    }

    #[tokio::test]
    async fn test_external_import_is_clean_restore() {
        let dir = tempfile::tempdir().unwrap();
        let config = external_config(dir.path());
        let runner = FakeRunner::new().on("pg_restore", FakeReply::fail("connection refused"));
        let stack = ComposeStack::new(&runner, &config);
        let dump = dir.path().join("database.dump");
        std::fs::write(&dump, "PGDMP").unwrap();

        let err = DatabaseTransfer::new(&stack).import(&dump).await.unwrap_err();
        assert_eq!(err.downcast_ref::<OpsError>().unwrap().step(), "database import");
        assert!(runner.called("--entrypoint pg_restore n8n --clean --if-exists --no-owner --dbname postgres://"));
        assert!(!runner.called("DROP DATABASE"));
    }

    #[tokio::test]
    async fn test_wait_for_database_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let runner = FakeRunner::new().on("pg_isready", FakeReply::fail("no response"));
        let stack = ComposeStack::new(&runner, &config);

        let transfer = DatabaseTransfer::new(&stack).with_ready_interval(Duration::ZERO);
        assert!(transfer.wait_for_database().await.is_err());
        assert_eq!(runner.count("pg_isready"), READY_ATTEMPTS as usize);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("n8n"), "\"n8n\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
