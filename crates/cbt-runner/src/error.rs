use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFailure {
    pub volume: usize,
    pub message: String,
    /// The workload died from SIGKILL rather than exiting on its own.
    pub killed: bool,
}

fn describe_failures(failures: &[JoinFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("volume {}: {}", f.volume, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("dispatch failed for volume {volume}: {message}")]
    Dispatch { volume: usize, message: String },

    #[error("{} of {total} workload dispatches failed: {}", .failures.len(), describe_failures(.failures))]
    Join {
        failures: Vec<JoinFailure>,
        total: usize,
    },

    #[error("recovery test failed: {0}")]
    Recovery(String),

    #[error("workload failed ({workload}) and recovery test failed ({recovery})")]
    WorkloadAndRecovery {
        workload: Box<RunError>,
        recovery: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    /// Stable machine-readable name for JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            RunError::Provisioning(_) => "provisioning_failed",
            RunError::Dispatch { .. } => "dispatch_failed",
            RunError::Join { .. } => "join_failed",
            RunError::Recovery(_) => "recovery_failed",
            RunError::WorkloadAndRecovery { .. } => "workload_and_recovery_failed",
            RunError::Other(_) => "command_failed",
        }
    }
}
