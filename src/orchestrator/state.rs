//! Phase State Management and Transition Tables
//!
//! This module provides the state tracking structures the executor uses to
//! drive a job's phase list.
//!
//! **Architecture**:
//! - `PhaseStatus`: per-phase state (pending → running → success | failed)
//! - `Phase`: one named step bound to an external playbook
//! - `PhasePlan`: the ordered phase container frozen into a `Job`
//!
//! A `PhasePlan` can only be produced by `PhasePlanBuilder`; once built it has
//! no operation that inserts, removes or reorders phases. Status changes go
//! through `start`/`finish`, which enforce strict list order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::JobStatus;

/// Per-phase status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
        }
    }

    /// Get all valid transitions FROM this status.
    pub fn valid_next(&self) -> &'static [PhaseStatus] {
        match self {
            PhaseStatus::Pending => &[PhaseStatus::Running],
            PhaseStatus::Running => &[PhaseStatus::Success, PhaseStatus::Failed],
            PhaseStatus::Success | PhaseStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        self.valid_next().contains(&next)
    }
}

impl JobStatus {
    /// Get all valid transitions FROM this job status.
    pub fn valid_next(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[JobStatus::Running, JobStatus::Failed, JobStatus::Cancelled],
            JobStatus::Running => &[JobStatus::Success, JobStatus::Failed, JobStatus::Cancelled],
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_next().contains(&next)
    }
}

/// One provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub playbook: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub(crate) fn new(name: impl Into<String>, playbook: impl Into<String>) -> Self {
        Phase {
            name: name.into(),
            playbook: playbook.into(),
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Ordered, fixed list of phases for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PhasePlan {
    phases: Vec<Phase>,
}

impl PhasePlan {
    pub(crate) fn from_phases(phases: Vec<Phase>) -> Self {
        PhasePlan { phases }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Phase> {
        self.phases.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }

    /// Progress value for the start of phase `index`: floor(index / total * 100).
    pub fn progress_at(&self, index: usize) -> u8 {
        if self.phases.is_empty() {
            return 0;
        }
        ((index * 100) / self.phases.len()).min(100) as u8
    }

    /// Mark phase `index` running.
    ///
    /// Fails unless the phase is pending and every earlier phase succeeded.
    pub fn start(&mut self, index: usize) -> Result<&Phase, String> {
        if let Some(blocker) = self.phases[..index.min(self.phases.len())]
            .iter()
            .find(|p| p.status != PhaseStatus::Success)
        {
            return Err(format!(
                "Cannot start phase {}: predecessor '{}' is {}",
                index,
                blocker.name,
                blocker.status.as_str()
            ));
        }
        let phase = self
            .phases
            .get_mut(index)
            .ok_or_else(|| format!("No phase at index {}", index))?;
        if !phase.status.can_transition_to(PhaseStatus::Running) {
            return Err(format!(
                "Invalid phase transition for '{}': {} -> running",
                phase.name,
                phase.status.as_str()
            ));
        }
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(Utc::now());
        Ok(phase)
    }

    /// Mark running phase `index` as success or failed and stamp its completion.
    pub fn finish(&mut self, index: usize, success: bool) -> Result<&Phase, String> {
        let next = if success {
            PhaseStatus::Success
        } else {
            PhaseStatus::Failed
        };
        let phase = self
            .phases
            .get_mut(index)
            .ok_or_else(|| format!("No phase at index {}", index))?;
        if !phase.status.can_transition_to(next) {
            return Err(format!(
                "Invalid phase transition for '{}': {} -> {}",
                phase.name,
                phase.status.as_str(),
                next.as_str()
            ));
        }
        phase.status = next;
        phase.completed_at = Some(Utc::now());
        Ok(phase)
    }
}

impl<'a> IntoIterator for &'a PhasePlan {
    type Item = &'a Phase;
    type IntoIter = std::slice::Iter<'a, Phase>;

    fn into_iter(self) -> Self::IntoIter {
        self.phases.iter()
    }
}
