//! Kubernetes provisioning engine
//!
//! Drives a cluster from "declared" to "running" by executing an ordered
//! plan of Ansible playbooks against the cluster's nodes, while persisting
//! progress, per-phase status and a log stream.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Cluster, node, credential, job and log records
//! - **config**: Engine settings (JSON file, environment overrides, validation)
//! - **credentials**: Credential Materializer and secret decryption
//! - **inventory**: Inventory Builder and job-scoped ephemeral artifacts
//! - **orchestrator**: Phase plan, phase execution, progress and job orchestration
//! - **queue**: Bounded worker pool dispatching jobs
//! - **store**: Persistence collaborator (in-memory and JSON file backends)
//! - **log_collector**: Process-wide log pipeline

// Core foundational modules
pub mod error;
pub mod models;

// Configuration management
pub mod config;

// Job inputs: secrets and host inventory
pub mod credentials;
pub mod inventory;

// Job execution and dispatch
pub mod orchestrator;
pub mod queue;

// Persistence collaborator
pub mod store;

// Robust, decoupled logging system
pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    ConfigError, CredentialError, DecryptError, ProvisionError, QueueError, RunnerError,
    StoreError,
};

pub use models::{
    AuthMethod, Cluster, ClusterSnapshot, ClusterStatus, Components, HardeningConfig, Job,
    JobLog, JobStatus, JobType, LogLevel, Node, NodeRole, NodeStatus, OsType, SshCredential,
    Topology,
};

pub use config::Settings;
pub use credentials::{AgeDecryptor, PlaintextDecryptor, SecretBundle, SecretDecryptor};
pub use inventory::{build_inventory, Inventory, InventoryArtifacts};
pub use log_collector::{LogCollector, LogLine};
pub use orchestrator::{
    AnsibleRunner, JobContext, JobOrchestrator, PhaseExecutor, PhasePlan, PlaybookRunner,
    ProgressTracker, ProvisionOutcome,
};
pub use queue::{JobHandle, WorkerPool};
pub use store::{JobStore, JsonFileStore, MemoryStore};

/// Crate version, for CLI and log banners.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
