//! Orchestrator phases: the provisioning phase catalog and plan builder.
//!
//! - **plan**: derives the ordered `PhasePlan` for a cluster from its
//!   components and hardening configuration.
//!
//! The catalog is fixed; only the CNI, ingress and container runtime
//! selections change which playbook a phase points at.

pub mod plan;

pub use plan::{build_phase_plan, PhasePlanBuilder, PlanDefaults, ResolvedComponents};
