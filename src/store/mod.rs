//! Persistence collaborator.
//!
//! The engine reads a cluster snapshot once per job and writes back job
//! records, log entries, cluster status and the kube-access artifact. Two
//! backends are provided: `MemoryStore` for tests and embedding, and
//! `JsonFileStore` for the operator CLI.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ClusterSnapshot, ClusterStatus, Job, JobLog};

/// Storage backend used by the orchestrator.
///
/// `save_job` replaces the whole record; `append_log` must keep entries in
/// call order.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load cluster, nodes and credential record for `cluster_id`.
    async fn load_cluster(&self, cluster_id: Uuid) -> Result<ClusterSnapshot, StoreError>;

    async fn load_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn append_log(&self, entry: &JobLog) -> Result<(), StoreError>;

    async fn set_cluster_status(
        &self,
        cluster_id: Uuid,
        status: ClusterStatus,
    ) -> Result<(), StoreError>;

    /// Persist the admin kubeconfig produced by a successful provision.
    async fn store_kube_access(
        &self,
        cluster_id: Uuid,
        kubeconfig: &SecretString,
    ) -> Result<(), StoreError>;

    async fn job_logs(&self, job_id: Uuid) -> Result<Vec<JobLog>, StoreError>;
}
