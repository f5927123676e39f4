//! Build log relay
//!
//! Finds the build pod, then walks the stages in order: wait until the
//! stage's container is observably active, tail its log onto the app's log
//! channel, move on. A stage's lines are only published after its container
//! was seen running or terminated, so stages never interleave.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::job::SubmittedBuild;
use crate::error::{Error, Result};
use crate::progress::ProgressReporter;
use crate::provider::{ProviderError, WorkloadProvider};
use crate::state::{StageName, StagePhase, StageStatus};
use crate::wait::{poll_until, PollPolicy, Check, WaitError};

/// Waiting reasons that are a normal part of a container starting
const BENIGN_WAITING_REASONS: &[&str] = &["ContainerCreating", "PodInitializing"];

/// Classify one stage from a pod snapshot
#[must_use]
pub fn stage_status(pod: &Pod, stage: StageName) -> StageStatus {
    let Some(status) = pod.status.as_ref() else {
        return StageStatus::pending(stage);
    };

    let container = status
        .init_container_statuses
        .iter()
        .chain(status.container_statuses.iter())
        .flatten()
        .find(|c| c.name == stage.as_str());

    if let Some(observed) = container.and_then(|c| container_phase(c, stage)) {
        return observed;
    }

    if status.phase.as_deref() == Some("Failed") {
        let reason = status
            .reason
            .clone()
            .or_else(|| status.message.clone())
            .unwrap_or_else(|| "build pod failed".to_string());
        return StageStatus {
            name: stage,
            phase: StagePhase::Failed,
            reason: Some(reason),
        };
    }

    StageStatus::pending(stage)
}

fn container_phase(container: &ContainerStatus, stage: StageName) -> Option<StageStatus> {
    let state = container.state.as_ref()?;

    if state.running.is_some() {
        return Some(StageStatus {
            name: stage,
            phase: StagePhase::Running,
            reason: None,
        });
    }

    if let Some(terminated) = &state.terminated {
        if terminated.exit_code == 0 {
            return Some(StageStatus {
                name: stage,
                phase: StagePhase::Terminated,
                reason: terminated.reason.clone(),
            });
        }
        let reason = match &terminated.reason {
            Some(reason) => format!("{reason} (exit code {})", terminated.exit_code),
            None => format!("exit code {}", terminated.exit_code),
        };
        return Some(StageStatus {
            name: stage,
            phase: StagePhase::Failed,
            reason: Some(reason),
        });
    }

    let reason = state
        .waiting
        .as_ref()
        .and_then(|waiting| waiting.reason.as_deref())
        .filter(|reason| !reason.is_empty() && !BENIGN_WAITING_REASONS.contains(reason))?;

    Some(StageStatus {
        name: stage,
        phase: StagePhase::Failed,
        reason: Some(reason.to_string()),
    })
}

fn wait_error(err: WaitError<Error>, stage: Option<StageName>) -> Error {
    match err {
        WaitError::Failed(e) => e,
        WaitError::TimedOut(after) => {
            debug!(?stage, "Relay gave up waiting");
            Error::BuildTimeout(after)
        }
    }
}

/// What the relay tells the pipeline while it runs
#[derive(Debug)]
pub enum RelayEvent {
    /// The stage's container was seen running or terminated
    StageActive(StageName),
    /// A stage failed or the pod could not be followed
    Failed(Error),
}

/// Tails a build pod's stages onto the log bus
pub struct LogRelay {
    provider: Arc<dyn WorkloadProvider>,
    reporter: ProgressReporter,
    poll: PollPolicy,
    events: Option<mpsc::UnboundedSender<RelayEvent>>,
}

impl LogRelay {
    #[must_use]
    pub fn new(
        provider: Arc<dyn WorkloadProvider>,
        reporter: ProgressReporter,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            provider,
            reporter,
            poll: PollPolicy::fixed(poll_interval).with_deadline(deadline),
            events: None,
        }
    }

    /// Report stage progress and failures on `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RelayEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: RelayEvent) {
        if let Some(events) = &self.events {
            // The pipeline stops listening once the build is decided
            let _ = events.send(event);
        }
    }

    /// Run the relay, sending a failure as an event instead of returning it
    ///
    /// Used when the relay runs beside the completion wait: the pipeline
    /// listens for events and aborts as soon as a stage fails.
    pub async fn run_reporting(self, build: SubmittedBuild) {
        if let Err(e) = self.run(&build).await {
            self.emit(RelayEvent::Failed(e));
        }
    }

    pub async fn run(&self, build: &SubmittedBuild) -> Result<()> {
        self.reporter
            .system(format!("Waiting for build pod for job: {}...", build.job_name))
            .await;

        let pod_name = self.wait_for_pod(build).await?;
        self.reporter
            .system(format!("Found pod: {pod_name}. Preparing log stream..."))
            .await;

        for stage in StageName::ALL {
            let status = self.wait_for_stage(build, &pod_name, stage).await?;
            info!(job = %build.job_name, %stage, phase = ?status.phase, "Build stage observed");
            if status.is_active() {
                self.emit(RelayEvent::StageActive(stage));
            }

            self.reporter
                .system(format!("--- Starting step: {stage} ---"))
                .await;
            self.tail(build, &pod_name, stage).await;

            if status.phase == StagePhase::Failed {
                let reason = status.reason.unwrap_or_else(|| "unknown".to_string());
                return Err(Error::build_failed(Some(stage), reason));
            }
        }

        self.reporter.system("Build job logs finished.").await;
        Ok(())
    }

    async fn wait_for_pod(&self, build: &SubmittedBuild) -> Result<String> {
        let selector = build.pod_selector();
        let (provider, namespace, selector) =
            (&self.provider, build.namespace.as_str(), selector.as_str());

        let found = poll_until(self.poll, || async move {
            match provider.list_pods(namespace, selector).await {
                Ok(pods) => pods
                    .into_iter()
                    .find(|pod| {
                        pod.status
                            .as_ref()
                            .and_then(|s| s.phase.as_deref())
                            .is_some_and(|phase| phase != "Unknown")
                    })
                    .and_then(|pod| pod.metadata.name)
                    .map_or(Check::Pending, Check::Ready),
                Err(e) => {
                    debug!("Listing build pods failed, retrying: {}", e);
                    Check::Pending
                }
            }
        })
        .await;

        found.map_err(|e| wait_error(e, None))
    }

    async fn wait_for_stage(
        &self,
        build: &SubmittedBuild,
        pod_name: &str,
        stage: StageName,
    ) -> Result<StageStatus> {
        let (provider, namespace) = (&self.provider, build.namespace.as_str());

        let observed = poll_until(self.poll, || async move {
            match provider.get_pod(namespace, pod_name).await {
                Ok(pod) => {
                    let status = stage_status(&pod, stage);
                    match status.phase {
                        StagePhase::Pending => Check::Pending,
                        _ => Check::Ready(status),
                    }
                }
                Err(ProviderError::NotFound { .. }) => Check::Failed(Error::build_failed(
                    Some(stage),
                    format!("build pod {pod_name} disappeared"),
                )),
                Err(e) => {
                    debug!("Reading build pod failed, retrying: {}", e);
                    Check::Pending
                }
            }
        })
        .await;

        observed.map_err(|e| wait_error(e, Some(stage)))
    }

    /// Publish every line of one stage; a stream that cannot be opened is
    /// tolerated since the container may already be gone.
    async fn tail(&self, build: &SubmittedBuild, pod_name: &str, stage: StageName) {
        let mut lines = match self
            .provider
            .stream_logs(&build.namespace, pod_name, stage.as_str())
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!(
                    "Could not open log stream for {} (it might be done): {}",
                    stage, e
                );
                return;
            }
        };

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => self.reporter.stage(stage, &line).await,
                Err(e) => {
                    warn!("Log stream for {} broke: {}", stage, e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(status: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": "build-demodep-1-abcde" },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_status_is_pending() {
        let pod: Pod = serde_json::from_value(json!({ "metadata": { "name": "p" } })).unwrap();
        assert_eq!(stage_status(&pod, StageName::Fetch).phase, StagePhase::Pending);
    }

    #[test]
    fn test_running_init_container_is_active() {
        let pod = pod(json!({
            "phase": "Pending",
            "initContainerStatuses": [
                { "name": "fetch", "image": "git", "imageID": "", "ready": false, "restartCount": 0,
                  "state": { "running": { "startedAt": "2025-01-01T00:00:00Z" } } },
                { "name": "build", "image": "cnb", "imageID": "", "ready": false, "restartCount": 0,
                  "state": { "waiting": { "reason": "PodInitializing" } } }
            ]
        }));

        assert_eq!(stage_status(&pod, StageName::Fetch).phase, StagePhase::Running);
        assert_eq!(stage_status(&pod, StageName::Build).phase, StagePhase::Pending);
        assert_eq!(stage_status(&pod, StageName::Notify).phase, StagePhase::Pending);
    }

    #[test]
    fn test_container_creating_is_pending() {
        let pod = pod(json!({
            "phase": "Pending",
            "containerStatuses": [
                { "name": "notify", "image": "redis", "imageID": "", "ready": false, "restartCount": 0,
                  "state": { "waiting": { "reason": "ContainerCreating" } } }
            ]
        }));

        assert_eq!(stage_status(&pod, StageName::Notify).phase, StagePhase::Pending);
    }

    #[test]
    fn test_image_pull_error_is_failure() {
        let pod = pod(json!({
            "phase": "Pending",
            "initContainerStatuses": [
                { "name": "fetch", "image": "git", "imageID": "", "ready": false, "restartCount": 0,
                  "state": { "waiting": { "reason": "ErrImagePull", "message": "not found" } } }
            ]
        }));

        let status = stage_status(&pod, StageName::Fetch);
        assert_eq!(status.phase, StagePhase::Failed);
        assert_eq!(status.reason.as_deref(), Some("ErrImagePull"));
    }

    #[test]
    fn test_non_zero_exit_is_failure() {
        let pod = pod(json!({
            "phase": "Failed",
            "initContainerStatuses": [
                { "name": "fetch", "image": "git", "imageID": "", "ready": false, "restartCount": 0,
                  "state": { "terminated": { "exitCode": 0, "reason": "Completed" } } },
                { "name": "build", "image": "cnb", "imageID": "", "ready": false, "restartCount": 0,
                  "state": { "terminated": { "exitCode": 51, "reason": "Error" } } }
            ]
        }));

        assert_eq!(stage_status(&pod, StageName::Fetch).phase, StagePhase::Terminated);
        let build = stage_status(&pod, StageName::Build);
        assert_eq!(build.phase, StagePhase::Failed);
        assert_eq!(build.reason.as_deref(), Some("Error (exit code 51)"));
    }

    #[test]
    fn test_failed_pod_fails_unstarted_stage() {
        let pod = pod(json!({ "phase": "Failed", "reason": "DeadlineExceeded" }));

        let status = stage_status(&pod, StageName::Notify);
        assert_eq!(status.phase, StagePhase::Failed);
        assert_eq!(status.reason.as_deref(), Some("DeadlineExceeded"));
    }
}
