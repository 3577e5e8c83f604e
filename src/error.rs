//! Unified error type hierarchy for the provisioning engine
//!
//! Provides structured error handling with ProvisionError (the job-terminal
//! taxonomy), CredentialError, ConfigError, StoreError, QueueError and DecryptError.

use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Secret decryption errors raised by a `SecretDecryptor`.
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Ciphertext is malformed: {0}")]
    Malformed(String),

    #[error("No identity could decrypt the secret: {0}")]
    NoMatchingIdentity(String),

    #[error("Decrypted secret is not valid UTF-8")]
    InvalidUtf8,

    #[error("Identity unavailable: {0}")]
    Identity(String),
}

/// Credential materialization errors.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No usable {method} secret in credential record")]
    MissingSecret { method: &'static str },

    #[error("SSH username is empty")]
    EmptyUsername,

    #[error("Failed to decrypt {field}: {source}")]
    Decrypt {
        field: &'static str,
        #[source]
        source: DecryptError,
    },
}

/// Failures starting or supervising the external tool for one phase.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Playbook not found: {0}")]
    PlaybookMissing(std::path::PathBuf),

    #[error("Failed to start {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("Lost contact with the running tool: {0}")]
    Io(String),
}

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Persistence collaborator errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Worker pool submission errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Worker pool is shut down")]
    Closed,
}

/// Job-terminal provisioning errors.
///
/// Every variant ends the job: none of them is retried. The orchestrator
/// records `user_message()` into `Job.error_message` and the JobLog stream.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// No credential record exists for the cluster.
    #[error("SSH credentials not found for cluster {0}")]
    MissingCredential(Uuid),

    /// A credential record exists but holds no usable secret.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// A node cannot be mapped into an inventory group.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// The external tool exited non-zero (or could not be started) for a phase.
    #[error("Failed at phase: {phase}")]
    PhaseExecution { phase: String, reason: String },

    /// Ephemeral file creation or deletion failed.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// The job exceeded its wall-clock budget.
    #[error("Job timed out during phase: {phase}")]
    Timeout { phase: String },

    /// Cancellation was requested between phases.
    #[error("Job cancelled before phase: {phase}")]
    Cancelled { phase: String },

    /// A component selection cannot name a playbook.
    #[error("Invalid component selection: {0}")]
    InvalidComponent(String),

    #[error("Unsupported job type: {0}")]
    UnsupportedJobType(String),

    /// Persistence collaborator failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Anything else.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ProvisionError {
    /// Message recorded into `Job.error_message`.
    pub fn user_message(&self) -> String {
        match self {
            ProvisionError::MissingCredential(_) => "SSH credentials not found".to_string(),
            ProvisionError::PhaseExecution { phase, .. } => format!("Failed at phase: {}", phase),
            ProvisionError::Unexpected(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Terminal job status this error resolves to.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            ProvisionError::Cancelled { .. } => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    /// Name of the phase the error is attached to, if any.
    pub fn phase(&self) -> Option<&str> {
        match self {
            ProvisionError::PhaseExecution { phase, .. }
            | ProvisionError::Timeout { phase }
            | ProvisionError::Cancelled { phase } => Some(phase),
            _ => None,
        }
    }

    /// Whether the job had already claimed the cluster when this error ended it.
    ///
    /// Unsupported job types are rejected before the cluster status is touched.
    pub fn claims_cluster(&self) -> bool {
        !matches!(self, ProvisionError::UnsupportedJobType(_))
    }
}

impl From<io::Error> for ProvisionError {
    fn from(e: io::Error) -> Self {
        ProvisionError::Artifact(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_execution_message_names_phase() {
        let err = ProvisionError::PhaseExecution {
            phase: "Install Kubernetes Components".to_string(),
            reason: "exit code 2".to_string(),
        };
        assert_eq!(err.user_message(), "Failed at phase: Install Kubernetes Components");
        assert_eq!(err.phase(), Some("Install Kubernetes Components"));
    }

    #[test]
    fn test_missing_credential_message() {
        let err = ProvisionError::MissingCredential(Uuid::nil());
        assert_eq!(err.user_message(), "SSH credentials not found");
        assert_eq!(err.terminal_status(), JobStatus::Failed);
    }

    #[test]
    fn test_cancelled_maps_to_cancelled_status() {
        let err = ProvisionError::Cancelled {
            phase: "Join Worker Nodes".to_string(),
        };
        assert_eq!(err.terminal_status(), JobStatus::Cancelled);
        assert_eq!(err.user_message(), "Job cancelled before phase: Join Worker Nodes");
    }

    #[test]
    fn test_unsupported_job_type_leaves_cluster_alone() {
        assert!(!ProvisionError::UnsupportedJobType("scale".to_string()).claims_cluster());
        assert!(ProvisionError::MissingCredential(Uuid::nil()).claims_cluster());
    }

    #[test]
    fn test_io_error_becomes_artifact_error() {
        let err: ProvisionError = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, ProvisionError::Artifact(_)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileNotFound("/etc/settings.json".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration file not found: /etc/settings.json"
        );
    }
}
