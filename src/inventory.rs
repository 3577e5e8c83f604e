//! Inventory builder.
//!
//! Partitions a cluster's nodes into the `control_plane` and `workers` host
//! groups, renders them as an Ansible INI inventory and writes the job-scoped
//! artifacts (inventory file plus private key file) into a private temporary
//! directory that is removed when the job ends.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::credentials::{SecretBundle, SshAuth};
use crate::error::ProvisionError;
use crate::models::{Node, NodeRole};

pub const CONTROL_PLANE_GROUP: &str = "control_plane";
pub const WORKER_GROUP: &str = "workers";
pub const CLUSTER_GROUP: &str = "k8s_cluster";

const INVENTORY_FILE: &str = "inventory.ini";
const KEY_FILE: &str = "id_ssh";
const KUBECONFIG_FILE: &str = "admin.conf";

/// How one host authenticates.
pub enum HostAuth {
    KeyFile(PathBuf),
    Password(SecretString),
}

impl fmt::Debug for HostAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAuth::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            HostAuth::Password(_) => f.write_str("Password([REDACTED])"),
        }
    }
}

/// One inventory line.
#[derive(Debug)]
pub struct HostEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: HostAuth,
}

#[derive(Debug)]
pub struct HostGroup {
    pub name: &'static str,
    pub hosts: Vec<HostEntry>,
}

impl HostGroup {
    fn new(name: &'static str) -> Self {
        HostGroup {
            name,
            hosts: Vec::new(),
        }
    }
}

/// Structured inventory: two disjoint host groups.
#[derive(Debug)]
pub struct Inventory {
    pub control_plane: HostGroup,
    pub workers: HostGroup,
}

impl Inventory {
    pub fn host_count(&self) -> usize {
        self.control_plane.hosts.len() + self.workers.hosts.len()
    }

    /// Render INI inventory text. With `mask_secrets` passwords print as `********`.
    pub fn render(&self, mask_secrets: bool) -> String {
        let mut out = String::new();
        for group in [&self.control_plane, &self.workers] {
            out.push_str(&format!("[{}]\n", group.name));
            for host in &group.hosts {
                out.push_str(&format!(
                    "{} ansible_host={} ansible_port={} ansible_user={}",
                    host.name,
                    host.address,
                    host.port,
                    quote_value(&host.username)
                ));
                match &host.auth {
                    HostAuth::KeyFile(path) => out.push_str(&format!(
                        " ansible_ssh_private_key_file={}",
                        quote_value(&path.display().to_string())
                    )),
                    HostAuth::Password(password) => {
                        let value = if mask_secrets {
                            "********".to_string()
                        } else {
                            quote_value(password.expose_secret())
                        };
                        out.push_str(&format!(" ansible_ssh_pass={}", value));
                    }
                }
                out.push('\n');
            }
            out.push('\n');
        }

        out.push_str(&format!("[{}:children]\n", CLUSTER_GROUP));
        out.push_str(&format!("{}\n{}\n\n", CONTROL_PLANE_GROUP, WORKER_GROUP));
        out.push_str("[all:vars]\n");
        out.push_str("ansible_ssh_common_args='-o StrictHostKeyChecking=no'\n");
        out
    }
}

/// Quote an inventory value so the host-line tokenizer reads it back verbatim.
fn quote_value(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./@:+%,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r#"'"'"'"#))
    }
}

/// Partition `nodes` into host groups using the resolved credentials.
///
/// `key_file` is the path the private key will be written to; it is required
/// for key-based auth. Fails closed with `InvalidTopology` on an unknown role,
/// an unusable or duplicate host name, a missing address, or a cluster
/// without a control-plane node.
pub fn build_inventory(
    nodes: &[Node],
    secrets: &SecretBundle,
    key_file: Option<&Path>,
) -> Result<Inventory, ProvisionError> {
    if nodes.is_empty() {
        return Err(ProvisionError::InvalidTopology(
            "cluster has no nodes".to_string(),
        ));
    }

    let name_re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$")
        .map_err(|e| ProvisionError::Unexpected(format!("host name pattern: {}", e)))?;

    let mut inventory = Inventory {
        control_plane: HostGroup::new(CONTROL_PLANE_GROUP),
        workers: HostGroup::new(WORKER_GROUP),
    };
    let mut seen = HashSet::new();

    for node in nodes {
        if !name_re.is_match(&node.name) {
            return Err(ProvisionError::InvalidTopology(format!(
                "node name '{}' cannot be used as an inventory host",
                node.name
            )));
        }
        if !seen.insert(node.name.as_str()) {
            return Err(ProvisionError::InvalidTopology(format!(
                "duplicate node name '{}'",
                node.name
            )));
        }
        let address = node.ip_address.trim();
        if address.is_empty() || address.chars().any(char::is_whitespace) {
            return Err(ProvisionError::InvalidTopology(format!(
                "node '{}' has no usable address",
                node.name
            )));
        }

        let auth = match &secrets.auth {
            SshAuth::PrivateKey { .. } => {
                let path = key_file.ok_or_else(|| {
                    ProvisionError::Artifact("private key file path not provided".to_string())
                })?;
                HostAuth::KeyFile(path.to_path_buf())
            }
            SshAuth::Password(password) => {
                HostAuth::Password(SecretString::from(password.expose_secret().to_string()))
            }
        };
        let entry = HostEntry {
            name: node.name.clone(),
            address: address.to_string(),
            port: node.ssh_port,
            username: secrets.username.clone(),
            auth,
        };

        match &node.role {
            NodeRole::ControlPlane => inventory.control_plane.hosts.push(entry),
            NodeRole::Worker => inventory.workers.hosts.push(entry),
            NodeRole::Unrecognized(raw) => {
                return Err(ProvisionError::InvalidTopology(format!(
                    "node '{}' has unrecognized role '{}'",
                    node.name, raw
                )));
            }
        }
    }

    if inventory.control_plane.hosts.is_empty() {
        return Err(ProvisionError::InvalidTopology(
            "cluster has no control-plane node".to_string(),
        ));
    }

    log::debug!(
        "[Inventory] {} control-plane, {} worker hosts",
        inventory.control_plane.hosts.len(),
        inventory.workers.hosts.len()
    );
    Ok(inventory)
}

/// Job-scoped files handed to the external tool.
///
/// Everything lives in one private temporary directory. `cleanup` removes it
/// and reports failures; dropping without `cleanup` still removes it.
pub struct InventoryArtifacts {
    dir: Option<TempDir>,
    dir_path: PathBuf,
    inventory_path: PathBuf,
    key_path: Option<PathBuf>,
    host_count: usize,
}

impl InventoryArtifacts {
    /// Write key file and inventory for `job_id` under `work_dir`.
    ///
    /// If anything fails midway, whatever was already written is removed
    /// before the error is returned.
    pub fn create(
        work_dir: &Path,
        job_id: Uuid,
        nodes: &[Node],
        secrets: &SecretBundle,
    ) -> Result<Self, ProvisionError> {
        fs::create_dir_all(work_dir).map_err(|e| {
            ProvisionError::Artifact(format!(
                "cannot create work dir {}: {}",
                work_dir.display(),
                e
            ))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job_id))
            .tempdir_in(work_dir)
            .map_err(|e| ProvisionError::Artifact(format!("cannot create job dir: {}", e)))?;
        let dir_path = dir.path().to_path_buf();

        let key_path = match &secrets.auth {
            SshAuth::PrivateKey { key, passphrase } => {
                if passphrase.is_some() {
                    log::warn!(
                        "[Inventory] [Job {}] Key passphrase cannot be passed through the inventory; the key must be usable without it or loaded in ssh-agent",
                        job_id
                    );
                }
                let path = dir_path.join(KEY_FILE);
                let mut material = Zeroizing::new(key.expose_secret().to_string());
                if !material.ends_with('\n') {
                    material.push('\n');
                }
                write_private(&path, material.as_bytes())?;
                Some(path)
            }
            SshAuth::Password(_) => None,
        };

        let inventory = build_inventory(nodes, secrets, key_path.as_deref())?;
        let inventory_path = dir_path.join(INVENTORY_FILE);
        let rendered = Zeroizing::new(inventory.render(false));
        write_private(&inventory_path, rendered.as_bytes())?;

        log::info!(
            "[Inventory] [Job {}] Wrote inventory for {} hosts to {}",
            job_id,
            inventory.host_count(),
            dir_path.display()
        );
        Ok(InventoryArtifacts {
            dir: Some(dir),
            dir_path,
            inventory_path,
            key_path,
            host_count: inventory.host_count(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir_path
    }

    pub fn inventory_path(&self) -> &Path {
        &self.inventory_path
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Where the tool is asked to drop the admin kubeconfig.
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.dir_path.join(KUBECONFIG_FILE)
    }

    pub fn host_count(&self) -> usize {
        self.host_count
    }

    /// Remove every artifact now.
    pub fn cleanup(mut self) -> Result<(), ProvisionError> {
        match self.dir.take() {
            Some(dir) => dir.close().map_err(|e| {
                ProvisionError::Artifact(format!(
                    "failed to remove {}: {}",
                    self.dir_path.display(),
                    e
                ))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for InventoryArtifacts {
    fn drop(&mut self) {
        if self.dir.is_some() {
            log::warn!(
                "[Inventory] Artifacts at {} dropped without cleanup; removing",
                self.dir_path.display()
            );
        }
    }
}

/// Create `path` with owner-only permissions and write `contents`.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), ProvisionError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| ProvisionError::Artifact(format!("cannot create {}: {}", path.display(), e)))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| ProvisionError::Artifact(format!("cannot write {}: {}", path.display(), e)))
}
