//! Failure boundary around pipeline tasks
//!
//! A supervised pipeline runs in its own inner task. The supervisor joins it
//! and turns every way it can end (success, `Err`, panic) into a
//! [`PipelineReport`], publishing a failure line on the application's channel.
//! Nothing escapes to the intake loop.

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::progress::ProgressReporter;

/// How a pipeline task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Succeeded,
    Failed { kind: &'static str, message: String },
    Panicked(String),
}

impl PipelineOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub application_name: String,
    pub kind: &'static str,
    pub outcome: PipelineOutcome,
    pub elapsed: Duration,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn `pipeline` on `tracker` behind a failure boundary
///
/// The returned handle always resolves to a report; it never carries the
/// pipeline's panic.
pub fn spawn_supervised<F>(
    tracker: &TaskTracker,
    reporter: ProgressReporter,
    application_name: String,
    kind: &'static str,
    pipeline: F,
) -> JoinHandle<PipelineReport>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let span = info_span!("pipeline", app = %application_name, kind);

    tracker.spawn(
        async move {
            let started = Instant::now();
            let outcome = match tokio::spawn(pipeline.in_current_span()).await {
                Ok(Ok(())) => {
                    info!("Pipeline finished");
                    PipelineOutcome::Succeeded
                }
                Ok(Err(e)) => {
                    warn!(error_kind = e.kind(), "Pipeline failed: {}", e);
                    reporter.system(format!("❌ {e}")).await;
                    PipelineOutcome::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
                Err(join_error) if join_error.is_panic() => {
                    let message = panic_message(join_error.into_panic().as_ref());
                    error!("Pipeline panicked: {}", message);
                    reporter
                        .system(format!("❌ Internal error while processing {kind}: {message}"))
                        .await;
                    PipelineOutcome::Panicked(message)
                }
                Err(join_error) => {
                    warn!("Pipeline task was cancelled: {}", join_error);
                    reporter.system("❌ Operation was cancelled").await;
                    PipelineOutcome::Failed {
                        kind: "cancelled",
                        message: join_error.to_string(),
                    }
                }
            };

            PipelineReport {
                application_name,
                kind,
                outcome,
                elapsed: started.elapsed(),
            }
        }
        .instrument(span),
    )
}
