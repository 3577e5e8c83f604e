//! Settings validation.

use crate::config::Settings;
use crate::error::ConfigError;

fn require_supported(kind: &str, value: &str, supported: &[String]) -> Result<(), ConfigError> {
    if supported.is_empty() {
        return Err(ConfigError::ValidationFailed(format!(
            "Supported {} list cannot be empty",
            kind
        )));
    }
    if !supported.iter().any(|s| s == value) {
        return Err(ConfigError::ValidationFailed(format!(
            "Default {} '{}' is not in the supported list ({})",
            kind,
            value,
            supported.join(", ")
        )));
    }
    Ok(())
}

/// Reject settings the engine cannot run with.
///
/// Checks:
/// - at least one concurrent job and a non-zero job timeout
/// - a non-empty playbook path and tool binary
/// - each component default appears in its supported list
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.max_concurrent_jobs == 0 {
        return Err(ConfigError::ValidationFailed(
            "max_concurrent_jobs must be at least 1".to_string(),
        ));
    }

    if settings.job_timeout_minutes == 0 {
        return Err(ConfigError::ValidationFailed(
            "job_timeout_minutes must be at least 1".to_string(),
        ));
    }

    if settings.playbooks_path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "playbooks_path cannot be empty".to_string(),
        ));
    }

    if settings.ansible_binary.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "ansible_binary cannot be empty".to_string(),
        ));
    }

    require_supported("CNI plugin", &settings.default_cni, &settings.supported_cni_plugins)?;
    require_supported(
        "ingress controller",
        &settings.default_ingress,
        &settings.supported_ingress_controllers,
    )?;
    require_supported(
        "container runtime",
        &settings.default_container_runtime,
        &settings.supported_container_runtimes,
    )?;

    Ok(())
}
