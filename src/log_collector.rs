//! Process log pipeline for the provisioner.
//!
//! Every `log::info!`/`warn!`/`error!` record is pushed onto an unbounded
//! crossbeam channel and written to disk by a dedicated OS thread, so logging
//! never blocks a job and works from any runtime.
//!
//! # Layout
//!
//! ```text
//! log::* macros / LogCollector::log_str
//!     |
//! [LogCollector] (non-blocking send)
//!     | (crossbeam unbounded channel)
//!     v
//! [DiskPersister thread]
//!     |-- <log_dir>/provisioner_<YYYYMMDD>.log   (every line)
//!     `-- <log_dir>/jobs/<job_id>.log            (lines mentioning an open job)
//! ```
//!
//! A job session mirrors every line that mentions the job id into the job's
//! own file until `end_job_session` is called. The persisted JobLog stream is
//! separate and goes through the store.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Internal message: a line, a session change, or a flush marker.
enum LogMessage {
    Line(LogLine),
    OpenSession(Uuid, PathBuf),
    CloseSession(Uuid),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// A formatted log line with its timestamp.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }
}

/// Default log directory: `<data dir>/k8s-provisioner/logs`, or `./logs`.
pub fn default_logs_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("k8s-provisioner").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Path of the per-job mirror file.
pub fn job_log_path(log_dir: &Path, job_id: Uuid) -> PathBuf {
    log_dir.join("jobs").join(format!("{}.log", job_id))
}

/// Non-blocking logger backed by a disk-writer thread.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_dir: PathBuf,
    level: LevelFilter,
    echo_stderr: bool,
    sessions: Arc<Mutex<HashMap<Uuid, PathBuf>>>,
}

impl LogCollector {
    /// Create the collector and start its writer thread.
    pub fn new(log_dir: PathBuf, level: LevelFilter) -> Result<Self, String> {
        std::fs::create_dir_all(log_dir.join("jobs"))
            .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

        let (tx, rx) = unbounded::<LogMessage>();
        let main_log = log_dir.join(format!("provisioner_{}.log", Local::now().format("%Y%m%d")));

        std::thread::spawn(move || {
            let mut main_file = open_append(&main_log);
            let mut job_files: HashMap<Uuid, (String, File)> = HashMap::new();

            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        let formatted = format!("[{}] {}\n", line.timestamp, line.message);
                        if let Some(file) = main_file.as_mut() {
                            let _ = file.write_all(formatted.as_bytes());
                        }
                        for (key, file) in job_files.values_mut() {
                            if line.message.contains(key.as_str()) {
                                let _ = file.write_all(formatted.as_bytes());
                            }
                        }
                    }
                    LogMessage::OpenSession(job_id, path) => {
                        if let Some(file) = open_append(&path) {
                            job_files.insert(job_id, (job_id.to_string(), file));
                        }
                    }
                    LogMessage::CloseSession(job_id) => {
                        if let Some((_, mut file)) = job_files.remove(&job_id) {
                            let _ = file.flush();
                        }
                    }
                    LogMessage::Flush(done) => {
                        if let Some(file) = main_file.as_mut() {
                            let _ = file.flush();
                        }
                        for (_, file) in job_files.values_mut() {
                            let _ = file.flush();
                        }
                        let _ = done.send(());
                    }
                }
            }
            eprintln!("[Log] Disk persister thread shutting down");
        });

        Ok(LogCollector {
            tx,
            log_dir,
            level,
            echo_stderr: false,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Also print every accepted record to stderr.
    pub fn with_stderr_echo(mut self, echo: bool) -> Self {
        self.echo_stderr = echo;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Start mirroring lines that mention `job_id` into `<log_dir>/jobs/<job_id>.log`.
    pub fn start_job_session(&self, job_id: Uuid) -> Result<PathBuf, String> {
        let path = job_log_path(&self.log_dir, job_id);
        self.sessions
            .lock()
            .map_err(|e| format!("Failed to lock session state: {}", e))?
            .insert(job_id, path.clone());
        self.tx
            .send(LogMessage::OpenSession(job_id, path.clone()))
            .map_err(|e| format!("Failed to open job session: {}", e))?;
        Ok(path)
    }

    pub fn end_job_session(&self, job_id: Uuid) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&job_id);
        }
        let _ = self.tx.send(LogMessage::CloseSession(job_id));
    }

    pub fn job_session_path(&self, job_id: Uuid) -> Option<PathBuf> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(&job_id).cloned())
    }

    /// Send a line (never blocks, never fails).
    pub fn log_str(&self, message: impl Into<String>) {
        let message = message.into();
        if self.echo_stderr {
            eprintln!("{}", message);
        }
        let _ = self.tx.send(LogMessage::Line(LogLine::new(message)));
    }

    /// Wait until every line sent before this call has been written and flushed.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(LogMessage::Flush(done_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        done_rx
            .await
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_str(format!("[{}] {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install `collector` as the process-wide `log` backend.
pub fn init_global_logger(collector: &LogCollector) -> Result<(), String> {
    log::set_boxed_logger(Box::new(collector.clone()))
        .map_err(|e| format!("Logger already installed: {}", e))?;
    log::set_max_level(collector.level);
    Ok(())
}

/// Parse a settings log level (`debug`, `info`, `warning`, ...).
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "critical" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn open_append(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("[Log] Failed to open {}: {}", path.display(), e);
            None
        }
    }
}
