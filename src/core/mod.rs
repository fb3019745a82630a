pub mod archive;
pub mod backup;
pub mod config;
pub mod docker;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod lock;
pub mod process;
pub mod rollback;
pub mod storage;
pub mod transfer;
pub mod versions;

#[cfg(test)]
pub(crate) mod testing;

pub use backup::BackupManager;
pub use config::{ConfigManager, StackConfig};
pub use docker::ComposeStack;
pub use error::OpsError;
pub use health::{HealthChecker, ReqwestProbe};
pub use lifecycle::{Lifecycle, TerminalPrompt, UpgradeTarget};
pub use process::SystemRunner;
