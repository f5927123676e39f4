//! Deployment state model
//!
//! Nothing here is persisted. The cluster is the source of truth for what is
//! running; these types describe where a single pipeline run currently is and
//! what the log relay observed about a build stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::naming::ResourceNames;

/// One ordered phase of the build Job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    /// Clone the repository into the shared workspace
    Fetch,
    /// Run the buildpacks lifecycle and push the image
    Build,
    /// Push the completion signal
    Notify,
}

impl StageName {
    /// Stages in execution order
    pub const ALL: [StageName; 3] = [StageName::Fetch, StageName::Build, StageName::Notify];

    /// Container name of the stage inside the build pod
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::Notify => "notify",
        }
    }

    /// Tag prefixed to every log line relayed from this stage
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Fetch => "FETCH",
            Self::Build => "BUILD",
            Self::Notify => "NOTIFY",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed phase of a build stage container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Pending,
    Running,
    Terminated,
    Failed,
}

/// Live observation of one stage, read from the pod status on every poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub name: StageName,
    pub phase: StagePhase,
    pub reason: Option<String>,
}

impl StageStatus {
    #[must_use]
    pub fn pending(name: StageName) -> Self {
        Self {
            name,
            phase: StagePhase::Pending,
            reason: None,
        }
    }

    /// Running or terminated: the container has output worth tailing
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.phase, StagePhase::Running | StagePhase::Terminated)
    }
}

/// Steps of the release, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStep {
    Namespace,
    Workload,
    Service,
    Route,
}

impl fmt::Display for ReleaseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => write!(f, "namespace"),
            Self::Workload => write!(f, "workload"),
            Self::Service => write!(f, "service"),
            Self::Route => write!(f, "route"),
        }
    }
}

/// Steps of a decommission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecommissionStep {
    ScaleDown,
    Workload,
    Service,
    Route,
    Namespace,
}

impl fmt::Display for DecommissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScaleDown => write!(f, "scale-down"),
            Self::Workload => write!(f, "workload"),
            Self::Service => write!(f, "service"),
            Self::Route => write!(f, "route"),
            Self::Namespace => write!(f, "namespace"),
        }
    }
}

/// Where a pipeline run currently is
///
/// Create: `Queued → BuildSubmitted → BuildRunning(stage) → BuildFailed | BuildSucceeded → Releasing(step) → Live`
///
/// Delete: `Live → Draining → Deleting → Deleted` (graceful) or `Live → Deleting → Deleted` (forced)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Queued,
    BuildSubmitted,
    BuildRunning(StageName),
    BuildFailed,
    BuildSucceeded,
    Releasing(ReleaseStep),
    Live,
    Draining,
    Deleting,
    Deleted,
}

impl DeploymentState {
    /// Whether `next` is a legal successor of `self`
    #[must_use]
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState as S;

        match (self, next) {
            (S::Queued, S::BuildSubmitted)
            | (S::BuildSubmitted, S::BuildRunning(_) | S::BuildFailed | S::BuildSucceeded)
            | (S::BuildRunning(_), S::BuildRunning(_) | S::BuildFailed | S::BuildSucceeded)
            | (S::BuildSucceeded, S::Releasing(_))
            | (S::Releasing(_), S::Releasing(_) | S::Live)
            | (S::Live, S::Draining | S::Deleting)
            | (S::Draining, S::Deleting)
            | (S::Deleting, S::Deleted) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::BuildFailed | Self::Deleted)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::BuildSubmitted => write!(f, "build-submitted"),
            Self::BuildRunning(stage) => write!(f, "build-running({stage})"),
            Self::BuildFailed => write!(f, "build-failed"),
            Self::BuildSucceeded => write!(f, "build-succeeded"),
            Self::Releasing(step) => write!(f, "releasing({step})"),
            Self::Live => write!(f, "live"),
            Self::Draining => write!(f, "draining"),
            Self::Deleting => write!(f, "deleting"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// The state of one pipeline run, with the path it took
#[derive(Debug, Clone)]
pub struct StateTracker {
    application_name: String,
    history: Vec<DeploymentState>,
}

impl StateTracker {
    #[must_use]
    pub fn new(application_name: impl Into<String>, initial: DeploymentState) -> Self {
        Self {
            application_name: application_name.into(),
            history: vec![initial],
        }
    }

    #[must_use]
    pub fn current(&self) -> DeploymentState {
        // history is never empty
        self.history[self.history.len() - 1]
    }

    #[must_use]
    pub fn history(&self) -> &[DeploymentState] {
        &self.history
    }

    pub fn advance(&mut self, next: DeploymentState) {
        let current = self.current();
        if current.can_transition_to(next) {
            info!(app = %self.application_name, from = %current, to = %next, "State transition");
        } else {
            warn!(app = %self.application_name, from = %current, to = %next, "Unexpected state transition");
        }
        self.history.push(next);
    }
}

/// Runtime resources backing a live application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub application_name: String,
    pub image_reference: String,
    pub names: ResourceNames,
    pub url: String,
    /// States the create pipeline went through, ending at `Live`
    pub history: Vec<DeploymentState>,
}
