//! Job orchestration: one provisioning job from queued to a terminal status.
//!
//! Snapshot load -> credential materialization -> inventory artifacts ->
//! phase plan -> phase execution -> artifact cleanup -> terminal record.
//!
//! Every stage returns `Result<_, ProvisionError>`; `JobOrchestrator::run_job`
//! is the only place those errors are turned into a terminal job record, so a
//! job that was started always ends in `success`, `failed` or `cancelled`.

pub mod executor;
pub mod phases;
pub mod progress;
pub mod state;

use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

pub use executor::{AnsibleRunner, PhaseExecutor, PlaybookExit, PlaybookInvocation, PlaybookRunner};
pub use phases::{build_phase_plan, PhasePlanBuilder, PlanDefaults, ResolvedComponents};
pub use progress::ProgressTracker;
pub use state::{Phase, PhasePlan, PhaseStatus};

use crate::config::Settings;
use crate::credentials::{materialize, SecretDecryptor, SshAuth};
use crate::error::ProvisionError;
use crate::inventory::InventoryArtifacts;
use crate::log_collector::LogCollector;
use crate::models::{ClusterStatus, Job, JobLog, JobStatus, JobType};
use crate::store::JobStore;

/// Capabilities a job runs with.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn JobStore>,
    pub decryptor: Arc<dyn SecretDecryptor>,
    pub runner: Arc<dyn PlaybookRunner>,
    pub settings: Settings,
    pub log_collector: Option<LogCollector>,
}

/// Result handed back to whoever dispatched the job.
///
/// The job record in the store is the result of record; this is for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub job_id: Uuid,
    pub status: Option<JobStatus>,
    pub success: bool,
    pub message: String,
}

impl ProvisionOutcome {
    fn refused(job_id: Uuid, message: String) -> Self {
        ProvisionOutcome {
            job_id,
            status: None,
            success: false,
            message,
        }
    }
}

/// What a successful run hands to finalization.
struct RunArtifacts {
    kubeconfig: Option<SecretString>,
}

/// Runs jobs against a shared `JobContext`.
#[derive(Clone)]
pub struct JobOrchestrator {
    ctx: Arc<JobContext>,
}

impl JobOrchestrator {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        JobOrchestrator { ctx }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Run job `job_id` to a terminal status.
    ///
    /// The job must be `queued`; anything else is refused and the record is
    /// left untouched. Setting `cancel` to `true` stops the job before its
    /// next phase.
    pub async fn run_job(&self, job_id: Uuid, cancel: watch::Receiver<bool>) -> ProvisionOutcome {
        let mut job = match self.ctx.store.load_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                log::error!("[Job {}] Cannot load job: {}", job_id, e);
                return ProvisionOutcome::refused(job_id, format!("Job not found: {}", e));
            }
        };
        if !job.status.can_transition_to(JobStatus::Running) {
            log::warn!("[Job {}] Refusing to run job in status {}", job_id, job.status);
            return ProvisionOutcome::refused(
                job_id,
                format!("Job is {}, expected queued", job.status),
            );
        }

        if let Some(collector) = &self.ctx.log_collector {
            if let Err(e) = collector.start_job_session(job_id) {
                log::warn!("[Job {}] No job log session: {}", job_id, e);
            }
        }

        let tracker = ProgressTracker::new(Arc::clone(&self.ctx.store), job_id);
        let deadline = Instant::now() + self.ctx.settings.job_timeout();
        let result = self.execute(&mut job, &tracker, deadline, cancel).await;
        let outcome = self.finalize(&mut job, &tracker, result).await;

        if let Some(collector) = &self.ctx.log_collector {
            collector.end_job_session(job_id);
        }
        outcome
    }

    async fn execute(
        &self,
        job: &mut Job,
        tracker: &ProgressTracker,
        deadline: Instant,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunArtifacts, ProvisionError> {
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        tracker.record(job).await?;
        tracker.log(JobLog::info(job.id, "Job started")).await?;
        log::info!("[Job {}] Started {} job for cluster {}", job.id, job.job_type, job.cluster_id);

        if job.job_type != JobType::Provision {
            return Err(ProvisionError::UnsupportedJobType(job.job_type.to_string()));
        }

        let snapshot = self.ctx.store.load_cluster(job.cluster_id).await?;
        tracker
            .cluster_status(job.cluster_id, ClusterStatus::Provisioning)
            .await?;

        let secrets = materialize(
            job.cluster_id,
            snapshot.credential.as_ref(),
            self.ctx.decryptor.as_ref(),
        )?;
        if let SshAuth::PrivateKey {
            passphrase: Some(_),
            ..
        } = &secrets.auth
        {
            tracker
                .log(JobLog::warning(
                    job.id,
                    "SSH key passphrase is not passed to the provisioning tool",
                ))
                .await?;
        }

        let artifacts = InventoryArtifacts::create(
            &self.ctx.settings.work_dir,
            job.id,
            &snapshot.nodes,
            &secrets,
        )?;
        drop(secrets);

        let components = self.ctx.settings.plan_defaults().resolve(&snapshot.cluster)?;
        job.phases = build_phase_plan(&snapshot.cluster, &components)?;
        tracker.record(job).await?;
        tracker
            .log(JobLog::info(
                job.id,
                format!(
                    "Phase plan: {} phases for {} hosts",
                    job.phases.len(),
                    artifacts.host_count()
                ),
            ))
            .await?;

        let mut extra_vars = vec![
            ("k8s_version".to_string(), snapshot.cluster.kubernetes_version.clone()),
            ("cni_plugin".to_string(), components.cni),
            ("ingress_controller".to_string(), components.ingress),
            ("container_runtime".to_string(), components.runtime),
            (
                "kubeconfig_dest".to_string(),
                artifacts.kubeconfig_path().display().to_string(),
            ),
        ];
        if let Some(pss) = snapshot
            .cluster
            .hardening_config
            .as_ref()
            .and_then(|h| h.pod_security_standards.clone())
            .filter(|p| !p.trim().is_empty())
        {
            extra_vars.push(("pod_security_standard".to_string(), pss));
        }

        let executor = PhaseExecutor::new(
            Arc::clone(&self.ctx.runner),
            tracker.clone(),
            deadline,
            cancel,
        );
        let run_result = executor
            .run(job, artifacts.inventory_path(), &extra_vars)
            .await;

        let kubeconfig = match &run_result {
            Ok(()) => read_kubeconfig(&artifacts.kubeconfig_path(), job.id).await,
            Err(_) => None,
        };

        let cleanup = artifacts.cleanup();
        match (run_result, cleanup) {
            (Err(e), Err(cleanup_err)) => {
                log::error!("[Job {}] {}", job.id, cleanup_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(cleanup_err)) => Err(cleanup_err),
            (Ok(()), Ok(())) => Ok(RunArtifacts { kubeconfig }),
        }
    }

    async fn finalize(
        &self,
        job: &mut Job,
        tracker: &ProgressTracker,
        result: Result<RunArtifacts, ProvisionError>,
    ) -> ProvisionOutcome {
        let store = &self.ctx.store;
        match result {
            Ok(run) => {
                match run.kubeconfig {
                    Some(kubeconfig) => {
                        if let Err(e) = store.store_kube_access(job.cluster_id, &kubeconfig).await {
                            log::error!("[Job {}] Failed to store kubeconfig: {}", job.id, e);
                        }
                    }
                    None => {
                        if let Err(e) = tracker
                            .log(JobLog::warning(job.id, "No kubeconfig was produced"))
                            .await
                        {
                            log::error!("[Job {}] {}", job.id, e);
                        }
                    }
                }
                if let Err(e) = tracker
                    .cluster_status(job.cluster_id, ClusterStatus::Running)
                    .await
                {
                    log::error!("[Job {}] {}", job.id, e);
                }

                job.status = JobStatus::Success;
                job.set_progress(100);
                job.error_message = None;
                job.completed_at = Some(Utc::now());
                if let Err(e) = tracker.record(job).await {
                    log::error!("[Job {}] Failed to persist terminal state: {}", job.id, e);
                }
                let message = "Cluster provisioned successfully".to_string();
                if let Err(e) = tracker.log(JobLog::info(job.id, message.as_str())).await {
                    log::error!("[Job {}] {}", job.id, e);
                }
                log::info!("[Job {}] {}", job.id, message);

                ProvisionOutcome {
                    job_id: job.id,
                    status: Some(JobStatus::Success),
                    success: true,
                    message,
                }
            }
            Err(err) => {
                let status = err.terminal_status();
                let message = err.user_message();
                log::error!("[Job {}] {} ({:?})", job.id, message, err);

                let mut entry = JobLog::error(job.id, message.as_str());
                if let Some(phase) = err.phase() {
                    entry = entry.with_phase(phase);
                }
                if let Err(e) = tracker.log(entry).await {
                    log::error!("[Job {}] {}", job.id, e);
                }

                job.status = status;
                job.error_message = Some(message.clone());
                job.completed_at = Some(Utc::now());
                if let Err(e) = tracker.record(job).await {
                    log::error!("[Job {}] Failed to persist terminal state: {}", job.id, e);
                }
                if err.claims_cluster() {
                    if let Err(e) = tracker
                        .cluster_status(job.cluster_id, ClusterStatus::Failed)
                        .await
                    {
                        log::error!("[Job {}] {}", job.id, e);
                    }
                }

                ProvisionOutcome {
                    job_id: job.id,
                    status: Some(status),
                    success: false,
                    message,
                }
            }
        }
    }
}

async fn read_kubeconfig(path: &std::path::Path, job_id: Uuid) -> Option<SecretString> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if !contents.trim().is_empty() => Some(SecretString::from(contents)),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            log::warn!("[Job {}] Cannot read kubeconfig {}: {}", job_id, path.display(), e);
            None
        }
    }
}
