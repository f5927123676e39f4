//! Error types for the deployment pipelines

use std::time::Duration;
use thiserror::Error;

use crate::broker::QueueError;
use crate::provider::ProviderError;
use crate::state::{DecommissionStep, ReleaseStep, StageName};

/// Pipeline errors
///
/// Every variant ends up as a `[SYSTEM]` line on the application's log
/// channel, so the `Display` text is written for the person watching it.
#[derive(Error, Debug)]
pub enum Error {
    /// The work queue or log bus could not be reached
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    /// An intent or completion signal could not be decoded
    #[error("Malformed payload on {queue}: {reason}")]
    PayloadMalformed { queue: String, reason: String },

    /// A cluster call failed outside of any release/decommission step
    #[error("Cluster error: {0}")]
    Provider(#[from] ProviderError),

    /// A build stage failed or the build reported a non-ready status
    #[error("Build failed{}: {reason}", .stage.map(|s| format!(" at stage {s}")).unwrap_or_default())]
    BuildFailed {
        stage: Option<StageName>,
        reason: String,
    },

    /// No completion signal arrived in time
    #[error("Build did not complete within {}s", .0.as_secs())]
    BuildTimeout(Duration),

    #[error("Release step '{step}' failed: {source}")]
    ReleaseStepFailed {
        step: ReleaseStep,
        #[source]
        source: ProviderError,
    },

    #[error("Decommission step '{step}' failed: {source}")]
    DecommissionStepFailed {
        step: DecommissionStep,
        #[source]
        source: ProviderError,
    },

    /// The whole pipeline overran its deadline
    #[error("Pipeline exceeded its {}s deadline", .0.as_secs())]
    PipelineTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build failure helper
    pub fn build_failed(stage: Option<StageName>, reason: impl Into<String>) -> Self {
        Self::BuildFailed {
            stage,
            reason: reason.into(),
        }
    }

    /// Short machine-friendly kind, used as a tracing field
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueUnavailable(_) => "queue_unavailable",
            Self::PayloadMalformed { .. } => "payload_malformed",
            Self::Provider(_) => "provider_error",
            Self::BuildFailed { .. } => "build_failed",
            Self::BuildTimeout(_) => "build_timeout",
            Self::ReleaseStepFailed { .. } => "release_step_failed",
            Self::DecommissionStepFailed { .. } => "decommission_step_failed",
            Self::PipelineTimeout(_) => "pipeline_timeout",
            Self::Config(_) => "config_error",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
