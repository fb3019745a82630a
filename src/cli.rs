/// CLI argument parsing

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "n8n-ops")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Directory holding docker-compose.yml (default: discovered)
    #[arg(long, global = true, value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Environment file to read instead of <project-dir>/.env
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup archive of the database and configuration
    Backup,

    /// Restore database and configuration from a backup archive
    Restore {
        /// Path to an n8n_backup_*.tar.gz archive
        archive: PathBuf,

        /// Do not ask before overwriting
        #[arg(short, long)]
        yes: bool,
    },

    /// Move n8n to a specific version, with backup and rollback
    Migrate {
        /// n8n image tag to run (sets N8N_VERSION)
        #[arg(short, long)]
        target: String,

        /// Do not ask before stopping services
        #[arg(short, long)]
        yes: bool,

        /// Restore the pre-migration backup without asking if verification fails
        #[arg(long)]
        rollback_on_failure: bool,
    },

    /// Pull the configured images and restart, with backup and rollback
    Upgrade {
        /// Do not ask before stopping services
        #[arg(short, long)]
        yes: bool,

        /// Restore the pre-upgrade backup without asking if verification fails
        #[arg(long)]
        rollback_on_failure: bool,
    },

    /// Health check report
    Health,

    /// Set the number of worker containers
    Scale {
        /// Desired worker replicas
        count: u32,
    },

    /// List local backup archives, newest first
    List,

    /// Check that an archive is complete and restorable
    Verify {
        /// Path to an archive
        archive: PathBuf,
    },

    /// Show service status
    Status,

    /// Show the effective configuration (secrets masked)
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "n8n-ops", "migrate", "--target", "1.64.0", "-vv", "--project-dir", "/opt/n8n",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.project_dir, Some(PathBuf::from("/opt/n8n")));
        match cli.command {
            Commands::Migrate { target, yes, rollback_on_failure } => {
                assert_eq!(target, "1.64.0");
                assert!(!yes);
                assert!(!rollback_on_failure);
            }
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_scale_requires_number() {
        assert!(Cli::try_parse_from(["n8n-ops", "scale", "many"]).is_err());
        assert!(Cli::try_parse_from(["n8n-ops", "scale", "3"]).is_ok());
    }
}
