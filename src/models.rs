//! Core data types for the provisioning engine.
//!
//! These mirror the records owned by the surrounding CRUD layer. The engine
//! reads `Cluster`, `Node` and `SshCredential` as a snapshot and writes back
//! `Job`, `JobLog` and `Cluster.status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::orchestrator::state::PhasePlan;

/// Cluster lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Pending,
    Provisioning,
    Running,
    Failed,
    Deleted,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Running => "running",
            ClusterStatus::Failed => "failed",
            ClusterStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Node role within the cluster.
///
/// Parsing never fails: values other than `control-plane` and `worker` are
/// kept verbatim in `Unrecognized` so the inventory builder can reject them
/// with the offending value in the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRole {
    ControlPlane,
    Worker,
    Unrecognized(String),
}

impl NodeRole {
    pub fn as_str(&self) -> &str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
            NodeRole::Unrecognized(raw) => raw,
        }
    }
}

impl FromStr for NodeRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "control-plane" | "control_plane" => NodeRole::ControlPlane,
            "worker" => NodeRole::Worker,
            _ => NodeRole::Unrecognized(s.to_string()),
        })
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NodeRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct NodeRoleVisitor;

        impl<'de> Visitor<'de> for NodeRoleVisitor {
            type Value = NodeRole;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a node role string")
            }

            fn visit_str<E>(self, value: &str) -> Result<NodeRole, E>
            where
                E: de::Error,
            {
                match value.parse::<NodeRole>() {
                    Ok(role) => Ok(role),
                    Err(never) => match never {},
                }
            }
        }

        deserializer.deserialize_str(NodeRoleVisitor)
    }
}

/// Node operational status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    NotReady,
    Unknown,
}

/// Operating system of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Rocky9,
    Ubuntu22,
    Rhel9,
}

/// Declared cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Topology {
    #[serde(default)]
    pub ha: bool,
    pub control_plane_count: u32,
    pub worker_count: u32,
}

/// Software components selected for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Components {
    pub cni: Option<String>,
    #[serde(alias = "ingress")]
    pub ingress_controller: Option<String>,
    pub runtime: Option<String>,
    pub traffic_management_type: Option<String>,
    pub monitoring: bool,
    pub logging: bool,
}

/// Optional hardening configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HardeningConfig {
    pub cis_k8s_benchmark: bool,
    pub cis_linux_benchmark: bool,
    pub pod_security_standards: Option<String>,
    pub additional_k8s_config: bool,
}

/// Cluster definition (read-mostly input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ClusterStatus,
    pub kubernetes_version: String,
    pub topology: Topology,
    pub components: Components,
    #[serde(default)]
    pub hardening_config: Option<HardeningConfig>,
}

fn default_ssh_port() -> u16 {
    22
}

/// A target machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub role: NodeRole,
    pub ip_address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub os_type: OsType,
    #[serde(default)]
    pub status: NodeStatus,
}

/// SSH authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    PrivateKey,
    Password,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey => "private_key",
            AuthMethod::Password => "password",
        }
    }
}

/// Encrypted SSH credential record, one per cluster.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SshCredential {
    pub cluster_id: Uuid,
    pub username: String,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub private_key_encrypted: Option<String>,
    #[serde(default)]
    pub password_encrypted: Option<String>,
    #[serde(default)]
    pub passphrase_encrypted: Option<String>,
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredential")
            .field("cluster_id", &self.cluster_id)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("private_key_encrypted", &self.private_key_encrypted.is_some())
            .field("password_encrypted", &self.password_encrypted.is_some())
            .field("passphrase_encrypted", &self.passphrase_encrypted.is_some())
            .finish()
    }
}

/// Everything the engine reads for one job, loaded once at job start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: Cluster,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub credential: Option<SshCredential>,
}

/// Kind of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Provision,
    Scale,
    Upgrade,
    Deprovision,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Provision => "provision",
            JobType::Scale => "scale",
            JobType::Upgrade => "upgrade",
            JobType::Deprovision => "deprovision",
        };
        f.write_str(s)
    }
}

/// Job lifecycle status. `Queued` and `Running` are the only non-terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioning job and its observable progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub cluster_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub current_phase: Option<String>,
    #[serde(default)]
    pub phases: PhasePlan,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job, as the submission layer would.
    pub fn new(cluster_id: Uuid, job_type: JobType) -> Self {
        Job {
            id: Uuid::new_v4(),
            cluster_id,
            job_type,
            status: JobStatus::Queued,
            progress: 0,
            current_phase: None,
            phases: PhasePlan::default(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Raise progress; lower values are ignored so progress never goes back.
    pub fn set_progress(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }
}

/// Severity of a JobLog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One append-only entry of a job's log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub node: Option<String>,
    pub phase: Option<String>,
}

impl JobLog {
    pub fn new(job_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        JobLog {
            job_id,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            node: None,
            phase: None,
        }
    }

    pub fn info(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Info, message)
    }

    pub fn warning(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Warning, message)
    }

    pub fn error(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Error, message)
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_node(mut self, node: Option<String>) -> Self {
        self.node = node;
        self
    }
}
