//! Stable error taxonomy surfaced by the deploy core.

use serde::{Deserialize, Serialize};

/// Classified deploy failure. The orchestrator folds these into the deploy
/// result instead of raising; the wire tag is stable across all surfaces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DeployError {
    /// The agent's waiter queue is at capacity.
    #[error("deploy queue full")]
    QueueFull,

    /// The deploy worker terminated abnormally.
    #[error("deploy worker crashed: {reason}")]
    WorkerCrash { reason: String },

    /// A rollout strategy was requested but no Deployment manifest exists.
    #[error("no Deployment manifest found for rollout")]
    NoDeploymentFound,

    /// Passthrough classifications from the K8s collaborator.
    #[error("forbidden")]
    Forbidden,
    #[error("resource not found")]
    NotFound,
    #[error("request timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("apply failed: {message}")]
    ApplyFailed { message: String },
}

impl DeployError {
    /// Stable tag for telemetry labels and memory ingestion.
    pub fn tag(&self) -> &'static str {
        match self {
            DeployError::QueueFull => "queue_full",
            DeployError::WorkerCrash { .. } => "worker_crash",
            DeployError::NoDeploymentFound => "no_deployment_found",
            DeployError::Forbidden => "forbidden",
            DeployError::NotFound => "not_found",
            DeployError::Timeout => "timeout",
            DeployError::ConnectionRefused => "connection_refused",
            DeployError::ApplyFailed { .. } => "apply_failed",
        }
    }
}
