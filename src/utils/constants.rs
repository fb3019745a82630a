/// n8n stack layout and lifecycle defaults
///
/// Names here are shared by the archive builder, the validator and the
/// retention logic, so a file written by one is always found by the others.

/// Archive file names: `n8n_backup_<id>.tar.gz`
pub const BACKUP_PREFIX: &str = "n8n_backup_";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Rollback record file names: `rollback_<id>.json`
pub const ROLLBACK_PREFIX: &str = "rollback_";
pub const ROLLBACK_SUFFIX: &str = ".json";

/// Archive members
pub const DUMP_FILE: &str = "database.dump";
pub const ENV_SNAPSHOT: &str = ".env";
pub const METADATA_FILE: &str = "metadata.txt";

/// Members an archive must contain to be restorable
pub const REQUIRED_MEMBERS: &[&str] = &[DUMP_FILE, METADATA_FILE];

/// Advisory lock held by destructive flows, inside the backup directory
pub const LOCK_FILE: &str = ".n8n-ops.lock";

pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const ENV_FILE: &str = ".env";

/// Environment variable the compose file interpolates for the n8n image tag
pub const VERSION_OVERRIDE_VAR: &str = "N8N_VERSION";

/// Corrective commands surfaced in error hints
pub const START_COMMAND: &str = "docker compose up -d";
pub const RESTORE_COMMAND: &str = "sudo n8n-ops restore";

// Defaults for keys missing from .env
pub const DEFAULT_APP_SERVICE: &str = "n8n";
pub const DEFAULT_DB_SERVICE: &str = "postgres";
pub const DEFAULT_WORKER_SERVICE: &str = "n8n-worker";
pub const DEFAULT_DB_USER: &str = "n8n";
pub const DEFAULT_DB_NAME: &str = "n8n";
pub const DEFAULT_PROXY_DIR: &str = "traefik";
pub const DEFAULT_HEALTH_URL: &str = "http://localhost:5678/healthz";
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEALTH_ATTEMPTS: u32 = 24;
pub const DEFAULT_RETENTION: usize = 5;
pub const DEFAULT_DISK_WARN_PERCENT: f64 = 90.0;
pub const BACKUP_DIR_NAME: &str = "n8n-backups";

/// Keys whose values are never printed in full
pub const SENSITIVE_MARKERS: &[&str] = &["PASSWORD", "SECRET", "KEY", "TOKEN", "DATABASE_URL"];
