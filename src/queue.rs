//! Bounded worker pool for provisioning jobs.
//!
//! Submissions travel over a bounded channel to a dispatcher task, which
//! runs each job on its own tokio task once a concurrency permit is free.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::error::QueueError;
use crate::orchestrator::{JobContext, JobOrchestrator, ProvisionOutcome};

/// Pending submissions held before `submit` starts waiting.
const INTAKE_CAPACITY: usize = 64;

struct Submission {
    job_id: Uuid,
    cancel: watch::Receiver<bool>,
    reply: oneshot::Sender<ProvisionOutcome>,
}

/// Caller's side of one submitted job.
pub struct JobHandle {
    job_id: Uuid,
    cancel: watch::Sender<bool>,
    outcome: oneshot::Receiver<ProvisionOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Ask the job to stop before its next phase.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// A cancel sender detached from the handle, for signal handlers.
    pub fn canceller(&self) -> watch::Sender<bool> {
        self.cancel.clone()
    }

    /// Wait for the job to finish.
    ///
    /// `None` means the pool dropped the job without running it.
    pub async fn outcome(self) -> Option<ProvisionOutcome> {
        self.outcome.await.ok()
    }
}

/// Runs at most `workers` jobs at a time.
pub struct WorkerPool {
    intake: Mutex<Option<mpsc::Sender<Submission>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    /// Spawn the dispatcher on the current tokio runtime.
    pub fn start(ctx: Arc<JobContext>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
        let orchestrator = JobOrchestrator::new(ctx);
        let dispatcher = tokio::spawn(dispatch(orchestrator, rx, workers));
        log::info!("[Queue] Worker pool started with {} workers", workers);

        WorkerPool {
            intake: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue `job_id` for execution.
    pub async fn submit(&self, job_id: Uuid) -> Result<JobHandle, QueueError> {
        let tx = self
            .intake
            .lock()
            .map_err(|_| QueueError::Closed)?
            .clone()
            .ok_or(QueueError::Closed)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Submission {
            job_id,
            cancel: cancel_rx,
            reply: reply_tx,
        })
        .await
        .map_err(|_| QueueError::Closed)?;
        log::debug!("[Queue] [Job {}] Submitted", job_id);

        Ok(JobHandle {
            job_id,
            cancel: cancel_tx,
            outcome: reply_rx,
        })
    }

    /// Stop taking submissions and wait for queued and running jobs to finish.
    pub async fn shutdown(&self) {
        if let Ok(mut intake) = self.intake.lock() {
            intake.take();
        }
        let dispatcher = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                log::error!("[Queue] Dispatcher ended abnormally: {}", e);
            }
        }
        log::info!("[Queue] Worker pool stopped");
    }
}

async fn dispatch(
    orchestrator: JobOrchestrator,
    mut rx: mpsc::Receiver<Submission>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            Some(done) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = done {
                    log::error!("[Queue] Job task ended abnormally: {}", e);
                }
            }
            next = rx.recv() => {
                let Some(submission) = next else { break };
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let orchestrator = orchestrator.clone();
                running.spawn(async move {
                    let _permit = permit;
                    let Submission { job_id, cancel, reply } = submission;
                    log::info!("[Queue] [Job {}] Dispatched", job_id);
                    let outcome = orchestrator.run_job(job_id, cancel).await;
                    if reply.send(outcome).is_err() {
                        log::debug!("[Queue] [Job {}] Outcome receiver dropped", job_id);
                    }
                });
            }
        }
    }

    while let Some(done) = running.join_next().await {
        if let Err(e) = done {
            log::error!("[Queue] Job task ended abnormally: {}", e);
        }
    }
}
