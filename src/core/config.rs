/// Configuration management for the n8n stack
///
/// The `.env` file of the compose project is read once at process entry and
/// turned into a `StackConfig` that every component receives by reference.
/// Nothing in this crate writes the file back; that belongs to setup tooling.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::OpsError;
use crate::utils::*;

/// Raw key/value view of a `.env` file
pub struct ConfigManager {
    env_file: PathBuf,
    config: BTreeMap<String, String>,
}

impl ConfigManager {
    /// Load configuration from .env file
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();

        if !env_file.exists() {
            return Err(OpsError::precondition(
                "configuration",
                format!(".env file not found at {}", env_file.display()),
            )
            .into());
        }

        let mut config = BTreeMap::new();
        let entries = dotenv::from_path_iter(&env_file)
            .with_context(|| format!("Failed to read {}", env_file.display()))?;

        for entry in entries {
            let (key, value) = entry
                .with_context(|| format!("Failed to parse {}", env_file.display()))?;
            config.insert(key, value);
        }

        Ok(Self { env_file, config })
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Get a configuration value, treating empty values as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// Get all configuration keys (sorted)
    pub fn keys(&self) -> Vec<String> {
        self.config.keys().cloned().collect()
    }

    /// Value suitable for printing: secrets are masked
    pub fn display_value(&self, key: &str) -> Option<String> {
        let value = self.config.get(key)?;
        if is_sensitive_key(key) {
            Some(mask_sensitive(value, 2))
        } else {
            Some(value.clone())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.get("DB_MODE").map(|m| m.to_lowercase()) {
            None => {}
            Some(mode) if mode == "local" => {}
            Some(mode) if mode == "external" => {
                if self.get("EXTERNAL_DATABASE_URL").is_none() {
                    errors.push("DB_MODE=external requires EXTERNAL_DATABASE_URL".to_string());
                }
            }
            Some(mode) => errors.push(format!("DB_MODE must be 'local' or 'external', got '{}'", mode)),
        }

        if let Some(url) = self.get("EXTERNAL_DATABASE_URL") {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                errors.push("EXTERNAL_DATABASE_URL must be a postgres:// connection string".to_string());
            }
        }

        if let Some(count) = self.get("BACKUP_RETENTION") {
            match count.parse::<usize>() {
                Ok(0) => errors.push("BACKUP_RETENTION must be at least 1".to_string()),
                Ok(_) => {}
                Err(_) => errors.push(format!("BACKUP_RETENTION is not a number: {}", count)),
            }
        }

        if let Some(percent) = self.get("BACKUP_DISK_WARN_PERCENT") {
            match percent.parse::<f64>() {
                Ok(p) if (0.0..=100.0).contains(&p) => {}
                _ => errors.push(format!("BACKUP_DISK_WARN_PERCENT must be 0-100, got {}", percent)),
            }
        }

        if let Some(interval) = self.get("HEALTH_CHECK_INTERVAL") {
            if humantime::parse_duration(interval).is_err() {
                errors.push(format!("HEALTH_CHECK_INTERVAL is not a duration: {}", interval));
            }
        }

        if let Some(attempts) = self.get("HEALTH_CHECK_ATTEMPTS") {
            if attempts.parse::<u32>().map(|a| a == 0).unwrap_or(true) {
                errors.push(format!("HEALTH_CHECK_ATTEMPTS must be a positive number, got {}", attempts));
            }
        }

        if self.get("S3_BUCKET").is_some()
            && (self.get("AWS_ACCESS_KEY_ID").is_none() || self.get("AWS_SECRET_ACCESS_KEY").is_none())
        {
            errors.push("S3_BUCKET is set but AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY are missing".to_string());
        }

        errors
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

/// Where the relational database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseMode {
    /// Postgres runs as a service of this compose project
    Local { user: String, database: String },
    /// Postgres is hosted elsewhere and reached through a connection string
    External { url: String },
}

impl DatabaseMode {
    pub fn label(&self) -> &'static str {
        match self {
            DatabaseMode::Local { .. } => "local",
            DatabaseMode::External { .. } => "external",
        }
    }
}

/// Compose service names used by the flows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    pub app: String,
    pub database: String,
    pub worker: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStorage {
    pub bucket: String,
    pub prefix: Option<String>,
    pub endpoint_url: Option<String>,
    /// Credentials handed to the upload process environment
    pub credentials: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub url: String,
    pub interval: Duration,
    pub attempts: u32,
}

/// Everything a lifecycle flow needs to know about the deployment
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub project_dir: PathBuf,
    pub env_file: PathBuf,
    pub compose_file: PathBuf,
    pub database: DatabaseMode,
    pub services: ServiceLayout,
    pub backup_dir: PathBuf,
    pub retention: usize,
    pub disk_warn_percent: f64,
    pub object_storage: Option<ObjectStorage>,
    pub health: HealthSettings,
    pub proxy_config_dir: PathBuf,
}

impl StackConfig {
    /// Load `.env` from the project directory (or `env_file`) and build the config
    pub fn load(project_dir: &Path, env_file: Option<&Path>) -> Result<Self> {
        let env_path = env_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| project_dir.join(ENV_FILE));
        let manager = ConfigManager::load(&env_path)?;
        Self::from_manager(project_dir, &manager)
    }

    pub fn from_manager(project_dir: &Path, manager: &ConfigManager) -> Result<Self> {
        let errors = manager.validate();
        if !errors.is_empty() {
            return Err(OpsError::precondition("configuration", errors.join("; "))
                .with_hint(format!("Fix {} and retry", manager.env_file().display()))
                .into());
        }

        let database = match manager.get("DB_MODE").map(|m| m.to_lowercase()) {
            Some(mode) if mode == "external" => external_database(manager)?,
            Some(_) => local_database(manager),
            // Older setups never wrote DB_MODE: the presence of a connection string decides
            None if manager.get("EXTERNAL_DATABASE_URL").is_some() => external_database(manager)?,
            None => local_database(manager),
        };

        let backup_dir = manager
            .get("BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(BACKUP_DIR_NAME));

        let interval = manager
            .get("HEALTH_CHECK_INTERVAL")
            .and_then(|v| humantime::parse_duration(v).ok())
            .unwrap_or(Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS));

        let object_storage = manager.get("S3_BUCKET").map(|bucket| {
            let credentials = ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_DEFAULT_REGION"]
                .iter()
                .filter_map(|key| manager.get(key).map(|v| (key.to_string(), v.to_string())))
                .collect();
            ObjectStorage {
                bucket: bucket.to_string(),
                prefix: manager.get("S3_PREFIX").map(|p| p.trim_matches('/').to_string()),
                endpoint_url: manager.get("S3_ENDPOINT_URL").map(str::to_string),
                credentials,
            }
        });

        let proxy_dir = manager.get("PROXY_CONFIG_DIR").unwrap_or(DEFAULT_PROXY_DIR);

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            env_file: manager.env_file().to_path_buf(),
            compose_file: project_dir.join(COMPOSE_FILE),
            database,
            services: ServiceLayout {
                app: manager.get("N8N_SERVICE").unwrap_or(DEFAULT_APP_SERVICE).to_string(),
                database: manager.get("POSTGRES_SERVICE").unwrap_or(DEFAULT_DB_SERVICE).to_string(),
                worker: manager.get("N8N_WORKER_SERVICE").unwrap_or(DEFAULT_WORKER_SERVICE).to_string(),
            },
            backup_dir,
            retention: manager.parse_or("BACKUP_RETENTION", DEFAULT_RETENTION),
            disk_warn_percent: manager.parse_or("BACKUP_DISK_WARN_PERCENT", DEFAULT_DISK_WARN_PERCENT),
            object_storage,
            health: HealthSettings {
                url: manager.get("N8N_HEALTH_URL").unwrap_or(DEFAULT_HEALTH_URL).to_string(),
                interval,
                attempts: manager.parse_or("HEALTH_CHECK_ATTEMPTS", DEFAULT_HEALTH_ATTEMPTS),
            },
            proxy_config_dir: project_dir.join(proxy_dir),
        })
    }

    pub fn is_local_database(&self) -> bool {
        matches!(self.database, DatabaseMode::Local { .. })
    }

    /// Services that must be running for the stack to count as up
    pub fn required_services(&self) -> Vec<String> {
        let mut services = vec![self.services.app.clone()];
        if self.is_local_database() {
            services.push(self.services.database.clone());
        }
        services
    }

    /// Services declared in docker-compose.yml, for diagnostics
    pub fn declared_services(&self) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(&self.compose_file)
            .with_context(|| format!("Failed to read {}", self.compose_file.display()))?;
        parse_compose_services(&content)
    }
}

fn local_database(manager: &ConfigManager) -> DatabaseMode {
    DatabaseMode::Local {
        user: manager.get("POSTGRES_USER").unwrap_or(DEFAULT_DB_USER).to_string(),
        database: manager.get("POSTGRES_DB").unwrap_or(DEFAULT_DB_NAME).to_string(),
    }
}

fn external_database(manager: &ConfigManager) -> Result<DatabaseMode> {
    let url = manager
        .get("EXTERNAL_DATABASE_URL")
        .ok_or_else(|| anyhow!("EXTERNAL_DATABASE_URL is not set"))?;
    Ok(DatabaseMode::External { url: url.to_string() })
}

/// Service names from the `services:` mapping of a compose file
pub fn parse_compose_services(content: &str) -> Result<Vec<String>> {
    use serde_yaml::Value;

    let yaml: Value = serde_yaml::from_str(content).context("Failed to parse docker-compose.yml")?;

    let services = yaml
        .get("services")
        .and_then(|s| s.as_mapping())
        .map(|map| {
            map.keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(services)
}
