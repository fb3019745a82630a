/// Error taxonomy for lifecycle operations
///
/// Soft verification failures are not represented here: they are returned
/// as values and inspected by the calling flow. Best-effort failures
/// (upload, retention, disk warnings) are logged and never reach this type.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    /// Checked before anything is mutated
    #[error("{step}: {message}")]
    Precondition {
        step: &'static str,
        message: String,
        hint: Option<String>,
    },

    /// An external dump/restore/pull/compose process exited non-zero
    #[error("{step} failed: {message}")]
    Transport {
        step: &'static str,
        message: String,
        hint: Option<String>,
    },

    /// The operator declined a confirmation gate
    #[error("{step}: aborted by operator")]
    Aborted { step: &'static str },

    /// Post-upgrade verification failed and rollback was declined
    #[error("{step}: {}", .reasons.join("; "))]
    VerificationFailed {
        step: &'static str,
        reasons: Vec<String>,
        hint: Option<String>,
    },

    /// Post-upgrade verification failed and the pre-upgrade archive was restored
    #[error("upgrade rolled back from {}", .archive.display())]
    RolledBack { archive: PathBuf, verified: bool },
}

impl OpsError {
    pub fn precondition(step: &'static str, message: impl Into<String>) -> Self {
        OpsError::Precondition {
            step,
            message: message.into(),
            hint: None,
        }
    }

    pub fn transport(step: &'static str, message: impl Into<String>) -> Self {
        OpsError::Transport {
            step,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a corrective command; no-op for variants without a hint
    pub fn with_hint(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            OpsError::Precondition { hint, .. }
            | OpsError::Transport { hint, .. }
            | OpsError::VerificationFailed { hint, .. } => *hint = Some(text.into()),
            OpsError::Aborted { .. } | OpsError::RolledBack { .. } => {}
        }
        self
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            OpsError::Precondition { hint, .. }
            | OpsError::Transport { hint, .. }
            | OpsError::VerificationFailed { hint, .. } => hint.as_deref(),
            OpsError::Aborted { .. } => None,
            OpsError::RolledBack { .. } => {
                Some("Services run the pre-upgrade data again. Check the upgrade notes before retrying.")
            }
        }
    }

    pub fn step(&self) -> &'static str {
        match self {
            OpsError::Precondition { step, .. }
            | OpsError::Transport { step, .. }
            | OpsError::Aborted { step }
            | OpsError::VerificationFailed { step, .. } => step,
            OpsError::RolledBack { .. } => "rollback",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            OpsError::Precondition { .. } => 2,
            OpsError::Aborted { .. } => 130,
            _ => 1,
        }
    }
}
