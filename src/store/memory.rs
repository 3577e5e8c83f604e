//! In-memory job store for tests and embedding.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ClusterSnapshot, ClusterStatus, Job, JobLog};

use super::JobStore;

/// Keeps every record in process memory.
///
/// Besides the current job record it keeps every saved revision, so callers
/// can inspect the sequence of snapshots a run produced.
#[derive(Default)]
pub struct MemoryStore {
    clusters: RwLock<HashMap<Uuid, ClusterSnapshot>>,
    jobs: RwLock<HashMap<Uuid, Vec<Job>>>,
    logs: RwLock<HashMap<Uuid, Vec<JobLog>>>,
    kube_access: RwLock<HashMap<Uuid, SecretString>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_cluster(&self, snapshot: ClusterSnapshot) -> Result<(), StoreError> {
        self.clusters
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(snapshot.cluster.id, snapshot);
        Ok(())
    }

    pub fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(job.id, vec![job]);
        Ok(())
    }

    /// Every saved revision of a job, oldest first.
    pub fn job_history(&self, job_id: Uuid) -> Vec<Job> {
        self.jobs
            .read()
            .ok()
            .and_then(|jobs| jobs.get(&job_id).cloned())
            .unwrap_or_default()
    }

    pub fn cluster_status(&self, cluster_id: Uuid) -> Option<ClusterStatus> {
        self.clusters
            .read()
            .ok()
            .and_then(|c| c.get(&cluster_id).map(|s| s.cluster.status))
    }

    /// Stored kubeconfig, exposed for assertions.
    pub fn kube_access(&self, cluster_id: Uuid) -> Option<String> {
        self.kube_access
            .read()
            .ok()
            .and_then(|k| k.get(&cluster_id).map(|s| s.expose_secret().to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn load_cluster(&self, cluster_id: Uuid) -> Result<ClusterSnapshot, StoreError> {
        self.clusters
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(&cluster_id)
            .cloned()
            .ok_or(StoreError::ClusterNotFound(cluster_id))
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(&job_id)
            .and_then(|history| history.last().cloned())
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .entry(job.id)
            .or_default()
            .push(job.clone());
        Ok(())
    }

    async fn append_log(&self, entry: &JobLog) -> Result<(), StoreError> {
        self.logs
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .entry(entry.job_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn set_cluster_status(
        &self,
        cluster_id: Uuid,
        status: ClusterStatus,
    ) -> Result<(), StoreError> {
        let mut clusters = self.clusters.write().map_err(|_| StoreError::Poisoned)?;
        let snapshot = clusters
            .get_mut(&cluster_id)
            .ok_or(StoreError::ClusterNotFound(cluster_id))?;
        snapshot.cluster.status = status;
        Ok(())
    }

    async fn store_kube_access(
        &self,
        cluster_id: Uuid,
        kubeconfig: &SecretString,
    ) -> Result<(), StoreError> {
        self.kube_access
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(
                cluster_id,
                SecretString::from(kubeconfig.expose_secret().to_string()),
            );
        Ok(())
    }

    async fn job_logs(&self, job_id: Uuid) -> Result<Vec<JobLog>, StoreError> {
        Ok(self
            .logs
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}
