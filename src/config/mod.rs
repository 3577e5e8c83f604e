//! Configuration for the provisioning engine.
//!
//! # Module Structure
//!
//! - `loader`: reads and writes `settings.json` and resolves its default path
//! - `validator`: checks a loaded `Settings` for values the engine cannot run with
//!
//! # Configuration Flow
//!
//! 1. `loader::load_or_default` reads the JSON file, or starts from defaults
//! 2. `Settings::apply_env_overrides` layers environment variables on top
//! 3. `validator::validate_settings` rejects unusable combinations
//!
//! `loader::load_settings` runs all three steps.

pub mod loader;
pub mod validator;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::orchestrator::phases::PlanDefaults;

/// Engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Ansible
    pub playbooks_path: PathBuf,
    pub ansible_binary: String,

    // Filesystem
    pub work_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,

    // Jobs
    pub max_concurrent_jobs: usize,
    pub job_timeout_minutes: u64,

    // Component defaults
    pub default_cni: String,
    pub default_ingress: String,
    pub default_container_runtime: String,
    pub supported_cni_plugins: Vec<String>,
    pub supported_ingress_controllers: Vec<String>,
    pub supported_container_runtimes: Vec<String>,

    /// age identity used to decrypt stored credentials. Unset means stored
    /// secrets are taken as plaintext.
    pub age_identity_path: Option<PathBuf>,
}

fn list(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        let app_dir = dirs::data_local_dir()
            .map(|d| d.join("k8s-provisioner"))
            .unwrap_or_else(|| PathBuf::from("."));
        Settings {
            playbooks_path: PathBuf::from("../ansible/playbooks"),
            ansible_binary: "ansible-playbook".to_string(),
            work_dir: std::env::temp_dir().join("k8s-provisioner"),
            data_dir: app_dir.join("data"),
            log_dir: app_dir.join("logs"),
            log_level: "info".to_string(),
            max_concurrent_jobs: 5,
            job_timeout_minutes: 120,
            default_cni: "calico".to_string(),
            default_ingress: "nginx".to_string(),
            default_container_runtime: "containerd".to_string(),
            supported_cni_plugins: list(&["calico", "cilium", "flannel"]),
            supported_ingress_controllers: list(&["nginx", "haproxy", "traefik"]),
            supported_container_runtimes: list(&["containerd"]),
            age_identity_path: None,
        }
    }
}

impl Settings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_minutes.saturating_mul(60))
    }

    pub fn plan_defaults(&self) -> PlanDefaults {
        PlanDefaults {
            cni: self.default_cni.clone(),
            ingress: self.default_ingress.clone(),
            runtime: self.default_container_runtime.clone(),
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ANSIBLE_PLAYBOOKS_PATH") {
            self.playbooks_path = PathBuf::from(v);
        }
        if let Some(v) = get("ANSIBLE_BINARY") {
            self.ansible_binary = v;
        }
        if let Some(v) = get("PROVISIONER_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "MAX_CONCURRENT_JOBS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("JOB_TIMEOUT_MINUTES") {
            self.job_timeout_minutes = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "JOB_TIMEOUT_MINUTES",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("DEFAULT_CNI") {
            self.default_cni = v.trim().to_lowercase();
        }
        if let Some(v) = get("DEFAULT_INGRESS") {
            self.default_ingress = v.trim().to_lowercase();
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.trim().to_lowercase();
        }
        if let Some(v) = get("AGE_IDENTITY_PATH") {
            self.age_identity_path = Some(PathBuf::from(v));
        }
        Ok(())
    }
}
