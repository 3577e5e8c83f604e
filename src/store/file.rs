//! JSON-file job store.
//!
//! Layout under the data directory:
//!
//! ```text
//! clusters/<cluster_id>.json     ClusterSnapshot (cluster, nodes, credential)
//! jobs/<job_id>.json             Job record, replaced atomically
//! logs/<job_id>.jsonl            JobLog stream, one JSON object per line
//! kubeconfigs/<cluster_id>       admin kubeconfig, mode 0600
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ClusterSnapshot, ClusterStatus, Job, JobLog};

use super::JobStore;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["clusters", "jobs", "logs", "kubeconfigs"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(JsonFileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cluster_path(&self, cluster_id: Uuid) -> PathBuf {
        self.root.join("clusters").join(format!("{}.json", cluster_id))
    }

    fn job_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join("jobs").join(format!("{}.json", job_id))
    }

    fn log_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join("logs").join(format!("{}.jsonl", job_id))
    }

    pub fn kubeconfig_path(&self, cluster_id: Uuid) -> PathBuf {
        self.root.join("kubeconfigs").join(cluster_id.to_string())
    }

    /// Write a cluster snapshot, as the surrounding CRUD layer would.
    pub async fn save_cluster(&self, snapshot: &ClusterSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.cluster_path(snapshot.cluster.id), &json).await
    }
}

/// Write to a sibling temp file and rename it over `path`.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    missing: StoreError,
) -> Result<T, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn load_cluster(&self, cluster_id: Uuid) -> Result<ClusterSnapshot, StoreError> {
        read_json(
            &self.cluster_path(cluster_id),
            StoreError::ClusterNotFound(cluster_id),
        )
        .await
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        read_json(&self.job_path(job_id), StoreError::JobNotFound(job_id)).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.job_path(job.id), &json).await
    }

    async fn append_log(&self, entry: &JobLog) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(entry.job_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn set_cluster_status(
        &self,
        cluster_id: Uuid,
        status: ClusterStatus,
    ) -> Result<(), StoreError> {
        let mut snapshot = self.load_cluster(cluster_id).await?;
        snapshot.cluster.status = status;
        self.save_cluster(&snapshot).await
    }

    async fn store_kube_access(
        &self,
        cluster_id: Uuid,
        kubeconfig: &SecretString,
    ) -> Result<(), StoreError> {
        let path = self.kubeconfig_path(cluster_id);
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(kubeconfig.expose_secret().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn job_logs(&self, job_id: Uuid) -> Result<Vec<JobLog>, StoreError> {
        let contents = match fs::read_to_string(self.log_path(job_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }
}
