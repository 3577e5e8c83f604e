//! Progress tracker: persists job snapshots and log entries.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::ProvisionError;
use crate::models::{ClusterStatus, Job, JobLog};
use crate::store::JobStore;

/// Writes one job's state through the store.
///
/// Called at job start, at every phase boundary and at the terminal
/// transition. It never changes the snapshot it is handed.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn JobStore>,
    job_id: Uuid,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn JobStore>, job_id: Uuid) -> Self {
        ProgressTracker { store, job_id }
    }

    /// Persist status, progress, current phase, phases and error message.
    pub async fn record(&self, job: &Job) -> Result<(), ProvisionError> {
        self.store.save_job(job).await?;
        log::debug!(
            "[Progress] [Job {}] status={} progress={} phase={}",
            self.job_id,
            job.status,
            job.progress,
            job.current_phase.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    pub async fn log(&self, entry: JobLog) -> Result<(), ProvisionError> {
        self.store.append_log(&entry).await?;
        Ok(())
    }

    pub async fn cluster_status(
        &self,
        cluster_id: Uuid,
        status: ClusterStatus,
    ) -> Result<(), ProvisionError> {
        self.store.set_cluster_status(cluster_id, status).await?;
        log::info!("[Progress] [Job {}] Cluster {} -> {}", self.job_id, cluster_id, status);
        Ok(())
    }
}
