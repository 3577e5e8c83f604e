//! Phase plan derivation.
//!
//! Every plan starts with preflight checks and system hardening, then installs
//! the container runtime, Kubernetes components, control plane, workers, CNI
//! and ingress, and ends with final validation. Clusters whose hardening
//! configuration asks for additional Kubernetes configuration get one more
//! phase at the very end.

use regex::Regex;

use crate::error::ProvisionError;
use crate::models::Cluster;
use crate::orchestrator::state::{Phase, PhasePlan};

pub const PREFLIGHT: &str = "Preflight Checks";
pub const SYSTEM_HARDENING: &str = "System Hardening";
pub const INSTALL_RUNTIME: &str = "Install Container Runtime";
pub const INSTALL_KUBERNETES: &str = "Install Kubernetes Components";
pub const INIT_CONTROL_PLANE: &str = "Initialize Control Plane";
pub const JOIN_WORKERS: &str = "Join Worker Nodes";
pub const INSTALL_CNI: &str = "Install CNI";
pub const INSTALL_INGRESS: &str = "Install Ingress";
pub const FINAL_VALIDATION: &str = "Final Validation";
pub const ADDITIONAL_K8S_CONFIG: &str = "Additional Kubernetes Configuration";

/// Fallback component selections used when a cluster leaves one unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDefaults {
    pub cni: String,
    pub ingress: String,
    pub runtime: String,
}

impl Default for PlanDefaults {
    fn default() -> Self {
        PlanDefaults {
            cni: "calico".to_string(),
            ingress: "nginx".to_string(),
            runtime: "containerd".to_string(),
        }
    }
}

/// Component selections after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedComponents {
    pub cni: String,
    pub ingress: String,
    pub runtime: String,
}

impl PlanDefaults {
    /// Apply defaults to a cluster's component selection.
    ///
    /// Blank values count as unset. The resolved names end up inside playbook
    /// file names, so anything outside `[a-z0-9-_]` is rejected.
    pub fn resolve(&self, cluster: &Cluster) -> Result<ResolvedComponents, ProvisionError> {
        let components = &cluster.components;
        let resolved = ResolvedComponents {
            cni: pick(components.cni.as_deref(), &self.cni),
            ingress: pick(components.ingress_controller.as_deref(), &self.ingress),
            runtime: pick(components.runtime.as_deref(), &self.runtime),
        };

        validate_component("cni", &resolved.cni)?;
        validate_component("ingress", &resolved.ingress)?;
        validate_component("runtime", &resolved.runtime)?;
        Ok(resolved)
    }
}

fn pick(selected: Option<&str>, fallback: &str) -> String {
    match selected.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_lowercase(),
        _ => fallback.to_string(),
    }
}

fn validate_component(kind: &str, value: &str) -> Result<(), ProvisionError> {
    let re = Regex::new(r"^[a-z0-9\-_]+$")
        .map_err(|e| ProvisionError::Unexpected(format!("component pattern: {}", e)))?;
    if !re.is_match(value) {
        log::warn!("[Plan] Rejected {} selection '{}'", kind, value);
        return Err(ProvisionError::InvalidComponent(format!(
            "{} '{}' is not a valid component name",
            kind, value
        )));
    }
    Ok(())
}

/// Accumulates phases in order and freezes them into a `PhasePlan`.
///
/// Phases can only be pushed to the end. `append_conditional` is the single
/// optional extension and may add at most one phase.
#[derive(Debug, Default)]
pub struct PhasePlanBuilder {
    phases: Vec<Phase>,
    conditional_appended: bool,
}

impl PhasePlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, name: impl Into<String>, playbook: impl Into<String>) -> Self {
        self.phases.push(Phase::new(name, playbook));
        self
    }

    /// Append one phase at the end when `condition` holds.
    ///
    /// Returns an error on a second conditional append, whether or not the
    /// first one actually added a phase.
    pub fn append_conditional(
        mut self,
        condition: bool,
        name: impl Into<String>,
        playbook: impl Into<String>,
    ) -> Result<Self, ProvisionError> {
        if self.conditional_appended {
            return Err(ProvisionError::Unexpected(
                "phase plan already has its conditional phase".to_string(),
            ));
        }
        self.conditional_appended = true;
        if condition {
            self.phases.push(Phase::new(name, playbook));
        }
        Ok(self)
    }

    pub fn build(self) -> PhasePlan {
        PhasePlan::from_phases(self.phases)
    }
}

/// Build the ordered phase list for `cluster`.
///
/// # Arguments
/// * `cluster` - Cluster whose hardening flags may add the last phase
/// * `components` - Selections from `PlanDefaults::resolve`, naming the
///   runtime, CNI and ingress playbooks
///
/// # Returns
/// * `Ok(PhasePlan)` with 9 phases, or 10 when additional Kubernetes
///   configuration is requested
pub fn build_phase_plan(
    cluster: &Cluster,
    components: &ResolvedComponents,
) -> Result<PhasePlan, ProvisionError> {
    let additional_config = cluster
        .hardening_config
        .as_ref()
        .map(|h| h.additional_k8s_config)
        .unwrap_or(false);

    let plan = PhasePlanBuilder::new()
        .push(PREFLIGHT, "preflight_check.yml")
        .push(SYSTEM_HARDENING, "system_hardening.yml")
        .push(INSTALL_RUNTIME, format!("install_{}.yml", components.runtime))
        .push(INSTALL_KUBERNETES, "install_kubernetes.yml")
        .push(INIT_CONTROL_PLANE, "init_control_plane.yml")
        .push(JOIN_WORKERS, "join_workers.yml")
        .push(INSTALL_CNI, format!("install_cni_{}.yml", components.cni))
        .push(INSTALL_INGRESS, format!("install_ingress_{}.yml", components.ingress))
        .push(FINAL_VALIDATION, "final_validation.yml")
        .append_conditional(additional_config, ADDITIONAL_K8S_CONFIG, "configure_kubelet.yml")?
        .build();

    log::debug!(
        "[Plan] Cluster '{}': {} phases (cni={}, ingress={}, runtime={})",
        cluster.name,
        plan.len(),
        components.cni,
        components.ingress,
        components.runtime
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterStatus, Components, HardeningConfig, Topology};
    use crate::orchestrator::state::PhaseStatus;
    use uuid::Uuid;

    fn plan_for(cluster: &Cluster) -> Result<PhasePlan, ProvisionError> {
        let components = PlanDefaults::default().resolve(cluster)?;
        build_phase_plan(cluster, &components)
    }

    fn cluster(components: Components, hardening: Option<HardeningConfig>) -> Cluster {
        Cluster {
            id: Uuid::new_v4(),
            name: "lab".to_string(),
            description: None,
            status: ClusterStatus::Pending,
            kubernetes_version: "1.29".to_string(),
            topology: Topology {
                ha: false,
                control_plane_count: 1,
                worker_count: 2,
            },
            components,
            hardening_config: hardening,
        }
    }

    #[test]
    fn test_default_plan_order_and_playbooks() {
        let plan = plan_for(&cluster(Components::default(), None)).unwrap();
        assert_eq!(
            plan.names(),
            vec![
                PREFLIGHT,
                SYSTEM_HARDENING,
                INSTALL_RUNTIME,
                INSTALL_KUBERNETES,
                INIT_CONTROL_PLANE,
                JOIN_WORKERS,
                INSTALL_CNI,
                INSTALL_INGRESS,
                FINAL_VALIDATION,
            ]
        );
        assert_eq!(plan.get(2).unwrap().playbook, "install_containerd.yml");
        assert_eq!(plan.get(6).unwrap().playbook, "install_cni_calico.yml");
        assert_eq!(plan.get(7).unwrap().playbook, "install_ingress_nginx.yml");
        assert!(plan.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn test_selected_components_parameterize_playbooks() {
        let components = Components {
            cni: Some("Cilium".to_string()),
            ingress_controller: Some("traefik".to_string()),
            runtime: Some("  ".to_string()),
            ..Components::default()
        };
        let plan = plan_for(&cluster(components, None)).unwrap();
        assert_eq!(plan.get(6).unwrap().playbook, "install_cni_cilium.yml");
        assert_eq!(plan.get(7).unwrap().playbook, "install_ingress_traefik.yml");
        assert_eq!(plan.get(2).unwrap().playbook, "install_containerd.yml");
    }

    #[test]
    fn test_additional_config_appends_last_phase() {
        let hardening = HardeningConfig {
            additional_k8s_config: true,
            ..HardeningConfig::default()
        };
        let plan = plan_for(&cluster(Components::default(), Some(hardening))).unwrap();
        assert_eq!(plan.len(), 10);
        let last = plan.get(9).unwrap();
        assert_eq!(last.name, ADDITIONAL_K8S_CONFIG);
        assert_eq!(last.playbook, "configure_kubelet.yml");
    }

    #[test]
    fn test_hardening_without_extra_config_keeps_nine_phases() {
        let hardening = HardeningConfig {
            cis_k8s_benchmark: true,
            ..HardeningConfig::default()
        };
        let plan = plan_for(&cluster(Components::default(), Some(hardening))).unwrap();
        assert_eq!(plan.len(), 9);
    }

    #[test]
    fn test_path_like_component_rejected() {
        let components = Components {
            cni: Some("../../etc/evil".to_string()),
            ..Components::default()
        };
        let err = plan_for(&cluster(components, None)).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidComponent(_)));
    }

    #[test]
    fn test_conditional_append_only_once() {
        let builder = PhasePlanBuilder::new()
            .push("A", "a.yml")
            .append_conditional(false, "B", "b.yml")
            .unwrap();
        assert!(builder.append_conditional(true, "C", "c.yml").is_err());
    }
}
