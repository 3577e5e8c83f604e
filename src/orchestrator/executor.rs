//! Phase execution: playbook spawning, output streaming, phase state machine.
//!
//! `PhaseExecutor` walks a job's `PhasePlan` strictly in order. For each phase
//! it persists the running state, streams every output line of the external
//! tool into the JobLog as it arrives, and settles the phase from the exit
//! status. The first failure stops the walk; later phases stay pending.
//!
//! `AnsibleRunner` is the production `PlaybookRunner`: one `ansible-playbook`
//! process per phase, stdout and stderr read line by line. Output is decoded
//! lossily; remote hosts may relay bytes that are not UTF-8.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ProvisionError, RunnerError};
use crate::models::{Job, JobLog};
use crate::orchestrator::progress::ProgressTracker;

const LINE_BUFFER: usize = 256;

/// Everything needed to run one phase's playbook.
#[derive(Debug, Clone)]
pub struct PlaybookInvocation {
    pub job_id: Uuid,
    pub phase: String,
    pub playbook: String,
    pub inventory: PathBuf,
    pub extra_vars: Vec<(String, String)>,
}

/// Exit status of the external tool. `None` means killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybookExit {
    pub code: Option<i32>,
}

impl PlaybookExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs one playbook and forwards its output lines, in order, to `lines`.
///
/// Dropping the returned future must stop the tool.
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &PlaybookInvocation,
        lines: mpsc::Sender<String>,
    ) -> Result<PlaybookExit, RunnerError>;
}

/// Drives `ansible-playbook`.
#[derive(Debug, Clone)]
pub struct AnsibleRunner {
    binary: String,
    playbooks_path: PathBuf,
}

impl AnsibleRunner {
    pub fn new(binary: impl Into<String>, playbooks_path: impl Into<PathBuf>) -> Self {
        AnsibleRunner {
            binary: binary.into(),
            playbooks_path: playbooks_path.into(),
        }
    }

    pub fn playbook_path(&self, playbook: &str) -> PathBuf {
        self.playbooks_path.join(playbook)
    }

    /// Arguments passed to the binary for `invocation`.
    pub fn args(&self, invocation: &PlaybookInvocation) -> Vec<String> {
        let mut args = vec![
            self.playbook_path(&invocation.playbook).display().to_string(),
            "-i".to_string(),
            invocation.inventory.display().to_string(),
        ];
        for (key, value) in &invocation.extra_vars {
            args.push("--extra-vars".to_string());
            args.push(extra_var(key, value));
        }
        args
    }
}

/// `key=value`, or a one-key JSON object when the value would be split.
fn extra_var(key: &str, value: &str) -> String {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        serde_json::json!({ key: value }).to_string()
    } else {
        format!("{}={}", key, value)
    }
}

#[async_trait]
impl PlaybookRunner for AnsibleRunner {
    async fn run(
        &self,
        invocation: &PlaybookInvocation,
        lines: mpsc::Sender<String>,
    ) -> Result<PlaybookExit, RunnerError> {
        let playbook = self.playbook_path(&invocation.playbook);
        if !playbook.is_file() {
            return Err(RunnerError::PlaybookMissing(playbook));
        }

        let mut command = Command::new(&self.binary);
        command
            .args(self.args(invocation))
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_STDOUT_CALLBACK", "yaml")
            .env("ANSIBLE_NOCOLOR", "1")
            .env("ANSIBLE_FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!(
            "[Phase] [Job {}] Spawning {} {}",
            invocation.job_id,
            self.binary,
            invocation.playbook
        );
        let mut child = command.spawn().map_err(|e| RunnerError::Spawn {
            binary: self.binary.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Io("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Io("stderr not captured".to_string()))?;
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_closed = false;
        let mut stderr_closed = false;

        // read_until keeps partial bytes in the buffer when another branch wins.
        while !(stdout_closed && stderr_closed) {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut stdout_buf), if !stdout_closed => {
                    stdout_closed = forward_line(read, &mut stdout_buf, &lines, "stdout").await;
                }
                read = stderr.read_until(b'\n', &mut stderr_buf), if !stderr_closed => {
                    stderr_closed = forward_line(read, &mut stderr_buf, &lines, "stderr").await;
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::Io(format!("failed to wait for process: {}", e)))?;
        Ok(PlaybookExit {
            code: status.code(),
        })
    }
}

/// Send the buffered line, if any. Returns `true` once the stream is done.
async fn forward_line(
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    lines: &mpsc::Sender<String>,
    stream: &str,
) -> bool {
    match read {
        Ok(n) => {
            if !buf.is_empty() {
                let _ = lines.send(decode_line(buf)).await;
                buf.clear();
            }
            n == 0
        }
        Err(e) => {
            let _ = lines.send(format!("{} read error: {}", stream, e)).await;
            true
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c: char| c == '\n' || c == '\r')
        .to_string()
}

/// How one phase ended from the executor's point of view.
enum PhaseEnd {
    Finished(Result<PlaybookExit, RunnerError>),
    TimedOut,
    Abandoned(ProvisionError),
}

/// Sequential phase state machine for one job.
pub struct PhaseExecutor {
    runner: Arc<dyn PlaybookRunner>,
    tracker: ProgressTracker,
    deadline: Instant,
    cancel: watch::Receiver<bool>,
    node_re: Option<Regex>,
}

impl PhaseExecutor {
    pub fn new(
        runner: Arc<dyn PlaybookRunner>,
        tracker: ProgressTracker,
        deadline: Instant,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        PhaseExecutor {
            runner,
            tracker,
            deadline,
            cancel,
            node_re: Regex::new(
                r"^(?:ok|changed|fatal|failed|skipping|unreachable):\s*\[([^\]\s]+)(?:\s*->[^\]]*)?\]",
            )
            .ok(),
        }
    }

    /// Run every phase of `job.phases` in order.
    ///
    /// # Returns
    /// * `Ok(())` when every phase succeeded
    /// * `Err(ProvisionError::Cancelled)` when cancellation was requested before a phase
    /// * `Err(ProvisionError::Timeout)` when the job deadline passed
    /// * `Err(ProvisionError::PhaseExecution)` when a phase failed
    pub async fn run(
        &self,
        job: &mut Job,
        inventory: &Path,
        extra_vars: &[(String, String)],
    ) -> Result<(), ProvisionError> {
        for index in 0..job.phases.len() {
            self.run_phase(job, index, inventory, extra_vars).await?;
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        job: &mut Job,
        index: usize,
        inventory: &Path,
        extra_vars: &[(String, String)],
    ) -> Result<(), ProvisionError> {
        let (name, playbook) = match job.phases.get(index) {
            Some(phase) => (phase.name.clone(), phase.playbook.clone()),
            None => {
                return Err(ProvisionError::Unexpected(format!(
                    "no phase at index {}",
                    index
                )))
            }
        };

        if *self.cancel.borrow() {
            log::warn!("[Phase] [Job {}] Cancelled before phase: {}", job.id, name);
            return Err(ProvisionError::Cancelled { phase: name });
        }
        if Instant::now() >= self.deadline {
            return Err(ProvisionError::Timeout { phase: name });
        }

        job.phases
            .start(index)
            .map_err(ProvisionError::Unexpected)?;
        job.current_phase = Some(name.clone());
        job.set_progress(job.phases.progress_at(index));
        self.tracker.record(job).await?;
        self.tracker
            .log(JobLog::info(job.id, format!("Starting phase: {}", name)).with_phase(&name))
            .await?;
        log::info!(
            "[Phase] [Job {}] Starting phase {}/{}: {}",
            job.id,
            index + 1,
            job.phases.len(),
            name
        );

        let invocation = PlaybookInvocation {
            job_id: job.id,
            phase: name.clone(),
            playbook,
            inventory: inventory.to_path_buf(),
            extra_vars: extra_vars.to_vec(),
        };

        let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
        let mut run = self.runner.run(&invocation, tx);
        let mut lines_open = true;

        let end = loop {
            tokio::select! {
                biased;
                line = rx.recv(), if lines_open => match line {
                    Some(line) => {
                        if let Err(e) = self.persist_line(job.id, &name, &line).await {
                            break PhaseEnd::Abandoned(e);
                        }
                    }
                    None => lines_open = false,
                },
                result = &mut run => break PhaseEnd::Finished(result),
                _ = tokio::time::sleep_until(self.deadline) => break PhaseEnd::TimedOut,
            }
        };
        // Dropping the run future kills a still-running child.
        drop(run);

        rx.close();
        if let PhaseEnd::Finished(_) = end {
            while let Some(line) = rx.recv().await {
                if let Err(e) = self.persist_line(job.id, &name, &line).await {
                    let _ = job.phases.finish(index, false);
                    return Err(e);
                }
            }
        }

        match end {
            PhaseEnd::Finished(Ok(exit)) if exit.success() => {
                self.settle(job, index, true).await?;
                self.tracker
                    .log(JobLog::info(job.id, format!("Phase completed: {}", name)).with_phase(&name))
                    .await?;
                log::info!("[Phase] [Job {}] Phase completed: {}", job.id, name);
                Ok(())
            }
            PhaseEnd::Finished(Ok(exit)) => {
                let reason = exit.describe();
                self.fail_phase(job, index, &name, &reason).await?;
                Err(ProvisionError::PhaseExecution { phase: name, reason })
            }
            PhaseEnd::Finished(Err(e)) => {
                let reason = e.to_string();
                self.fail_phase(job, index, &name, &reason).await?;
                Err(ProvisionError::PhaseExecution { phase: name, reason })
            }
            PhaseEnd::TimedOut => {
                self.fail_phase(job, index, &name, "job timeout exceeded").await?;
                Err(ProvisionError::Timeout { phase: name })
            }
            PhaseEnd::Abandoned(e) => {
                // The store is failing; settle the in-memory phase and give up.
                let _ = job.phases.finish(index, false);
                Err(e)
            }
        }
    }

    async fn settle(&self, job: &mut Job, index: usize, success: bool) -> Result<(), ProvisionError> {
        job.phases
            .finish(index, success)
            .map_err(ProvisionError::Unexpected)?;
        self.tracker.record(job).await
    }

    async fn fail_phase(
        &self,
        job: &mut Job,
        index: usize,
        name: &str,
        reason: &str,
    ) -> Result<(), ProvisionError> {
        log::error!("[Phase] [Job {}] Phase failed: {} ({})", job.id, name, reason);
        self.settle(job, index, false).await?;
        self.tracker
            .log(JobLog::error(job.id, format!("Phase failed: {} ({})", name, reason)).with_phase(name))
            .await
    }

    async fn persist_line(&self, job_id: Uuid, phase: &str, raw: &str) -> Result<(), ProvisionError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(());
        }
        let node = self.extract_node(line);
        self.tracker
            .log(JobLog::info(job_id, line).with_phase(phase).with_node(node))
            .await
    }

    /// Host name from task result lines such as `changed: [worker-1]`.
    fn extract_node(&self, line: &str) -> Option<String> {
        self.node_re
            .as_ref()?
            .captures(line)
            .map(|caps| caps[1].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobType;
    use crate::orchestrator::state::{Phase, PhasePlan, PhaseStatus};
    use crate::store::{JobStore, MemoryStore};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Emits canned lines and exit codes per playbook.
    struct ScriptedRunner {
        outputs: HashMap<String, (Vec<&'static str>, i32)>,
    }

    #[async_trait]
    impl PlaybookRunner for ScriptedRunner {
        async fn run(
            &self,
            invocation: &PlaybookInvocation,
            lines: mpsc::Sender<String>,
        ) -> Result<PlaybookExit, RunnerError> {
            let (out, code) = self
                .outputs
                .get(&invocation.playbook)
                .cloned()
                .unwrap_or((vec![], 0));
            for line in out {
                let _ = lines.send(line.to_string()).await;
            }
            Ok(PlaybookExit { code: Some(code) })
        }
    }

    /// Never finishes.
    struct HangingRunner;

    #[async_trait]
    impl PlaybookRunner for HangingRunner {
        async fn run(
            &self,
            _invocation: &PlaybookInvocation,
            _lines: mpsc::Sender<String>,
        ) -> Result<PlaybookExit, RunnerError> {
            std::future::pending::<()>().await;
            Ok(PlaybookExit { code: Some(0) })
        }
    }

    fn job_with(phases: &[(&str, &str)]) -> Job {
        let mut job = Job::new(Uuid::new_v4(), JobType::Provision);
        job.phases = PhasePlan::from_phases(
            phases.iter().map(|(n, p)| Phase::new(*n, *p)).collect(),
        );
        job
    }

    fn executor(
        runner: Arc<dyn PlaybookRunner>,
        store: Arc<MemoryStore>,
        job_id: Uuid,
        cancel: watch::Receiver<bool>,
    ) -> PhaseExecutor {
        PhaseExecutor::new(
            runner,
            ProgressTracker::new(store, job_id),
            Instant::now() + Duration::from_secs(60),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_lines_are_logged_with_phase_and_node() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job_with(&[("Preflight Checks", "preflight_check.yml")]);
        let runner = ScriptedRunner {
            outputs: HashMap::from([(
                "preflight_check.yml".to_string(),
                (vec!["PLAY [all]", "", "   ", "ok: [cp-1]", "changed: [worker-1 -> localhost]"], 0),
            )]),
        };
        let (_tx, rx) = watch::channel(false);
        executor(Arc::new(runner), store.clone(), job.id, rx)
            .run(&mut job, Path::new("/tmp/inv"), &[])
            .await
            .unwrap();

        let logs = store.job_logs(job.id).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Starting phase: Preflight Checks",
                "PLAY [all]",
                "ok: [cp-1]",
                "changed: [worker-1 -> localhost]",
                "Phase completed: Preflight Checks",
            ]
        );
        assert_eq!(logs[2].node.as_deref(), Some("cp-1"));
        assert_eq!(logs[3].node.as_deref(), Some("worker-1"));
        assert!(logs[1].node.is_none());
        assert!(logs.iter().all(|l| l.phase.as_deref() == Some("Preflight Checks")));
        assert_eq!(job.phases.get(0).unwrap().status, PhaseStatus::Success);
    }

    #[tokio::test]
    async fn test_failure_stops_later_phases() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job_with(&[("A", "a.yml"), ("B", "b.yml"), ("C", "c.yml")]);
        let runner = ScriptedRunner {
            outputs: HashMap::from([("b.yml".to_string(), (vec!["fatal: [cp-1]: FAILED!"], 2))]),
        };
        let (_tx, rx) = watch::channel(false);
        let err = executor(Arc::new(runner), store.clone(), job.id, rx)
            .run(&mut job, Path::new("/tmp/inv"), &[])
            .await
            .unwrap_err();

        match err {
            ProvisionError::PhaseExecution { phase, reason } => {
                assert_eq!(phase, "B");
                assert_eq!(reason, "exit code 2");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let statuses: Vec<_> = job.phases.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Success, PhaseStatus::Failed, PhaseStatus::Pending]
        );
        assert_eq!(job.progress, 33);
    }

    #[tokio::test]
    async fn test_cancel_before_phase_leaves_it_pending() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job_with(&[("A", "a.yml")]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = executor(
            Arc::new(ScriptedRunner {
                outputs: HashMap::new(),
            }),
            store,
            job.id,
            rx,
        )
        .run(&mut job, Path::new("/tmp/inv"), &[])
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled { ref phase } if phase == "A"));
        assert_eq!(job.phases.get(0).unwrap().status, PhaseStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_running_phase() {
        let store = Arc::new(MemoryStore::new());
        let mut job = job_with(&[("A", "a.yml"), ("B", "b.yml")]);
        let (_tx, rx) = watch::channel(false);
        let exec = PhaseExecutor::new(
            Arc::new(HangingRunner),
            ProgressTracker::new(store, job.id),
            Instant::now() + Duration::from_secs(5),
            rx,
        );
        let err = exec
            .run(&mut job, Path::new("/tmp/inv"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { ref phase } if phase == "A"));
        assert_eq!(job.phases.get(0).unwrap().status, PhaseStatus::Failed);
        assert_eq!(job.phases.get(1).unwrap().status, PhaseStatus::Pending);
    }

    #[test]
    fn test_decode_line_replaces_invalid_bytes() {
        assert_eq!(decode_line(b"caf\xe9\r\n"), "caf\u{FFFD}");
        assert_eq!(decode_line(b"ok: [cp-1]"), "ok: [cp-1]");
    }

    #[test]
    fn test_ansible_args() {
        let runner = AnsibleRunner::new("ansible-playbook", "/srv/playbooks");
        let invocation = PlaybookInvocation {
            job_id: Uuid::nil(),
            phase: "Install CNI".to_string(),
            playbook: "install_cni_calico.yml".to_string(),
            inventory: PathBuf::from("/tmp/job/inventory.ini"),
            extra_vars: vec![
                ("k8s_version".to_string(), "1.29".to_string()),
                ("kubeconfig_dest".to_string(), "/tmp/my dir/admin.conf".to_string()),
            ],
        };
        assert_eq!(
            runner.args(&invocation),
            vec![
                "/srv/playbooks/install_cni_calico.yml",
                "-i",
                "/tmp/job/inventory.ini",
                "--extra-vars",
                "k8s_version=1.29",
                "--extra-vars",
                r#"{"kubeconfig_dest":"/tmp/my dir/admin.conf"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_playbook_is_runner_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = AnsibleRunner::new("ansible-playbook", dir.path());
        let invocation = PlaybookInvocation {
            job_id: Uuid::nil(),
            phase: "Preflight Checks".to_string(),
            playbook: "preflight_check.yml".to_string(),
            inventory: dir.path().join("inventory.ini"),
            extra_vars: vec![],
        };
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            runner.run(&invocation, tx).await,
            Err(RunnerError::PlaybookMissing(_))
        ));
    }
}
