//! Create and delete pipelines
//!
//! One call per intent. The caller (the supervisor) only sees the final
//! `Result`; every step reports its own progress on the log bus.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::build::{BuildRunner, CompletionWaiter, LogRelay, RelayEvent};
use crate::context::Context;
use crate::decommission::DecommissionManager;
use crate::error::{Error, Result};
use crate::intent::{DeleteIntent, DeployIntent, Intent};
use crate::naming::ResourceNames;
use crate::progress::ProgressReporter;
use crate::release::ReleaseManager;
use crate::state::{DeploymentState, ReleaseRecord, StateTracker};

/// Run the pipeline for `intent` under its application's lease and the
/// pipeline deadline
pub async fn run_intent(ctx: Context, intent: Intent) -> Result<()> {
    let app = intent.application_name().to_string();
    let reporter = ctx.reporter_for(&app);

    let _lease = match ctx.leases.try_acquire(&app) {
        Some(lease) => lease,
        None => {
            reporter
                .system(format!("Waiting for another operation on {app} to finish..."))
                .await;
            ctx.leases.acquire(&app).await
        }
    };

    match &intent {
        // Bounds itself so a timed-out build is still cleaned up
        Intent::Create(create) => run_create(&ctx, &reporter, create).await.map(|_| ()),
        Intent::Delete(delete) => {
            let limit = ctx.config.timeouts.pipeline();
            within(
                Instant::now() + limit,
                limit,
                run_delete(&ctx, &reporter, delete),
            )
            .await
        }
    }
}

/// Run `step`, failing with `PipelineTimeout` once `deadline` passes
async fn within<T>(
    deadline: Instant,
    limit: Duration,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    timeout_at(deadline, step)
        .await
        .unwrap_or_else(|_| Err(Error::PipelineTimeout(limit)))
}

/// Build `intent`'s repository and release the resulting image
///
/// The whole run is bounded by the pipeline timeout. If the bound hits while
/// the build is in flight, the build Job is removed like any failed build.
pub async fn run_create(
    ctx: &Context,
    reporter: &ProgressReporter,
    intent: &DeployIntent,
) -> Result<ReleaseRecord> {
    let limit = ctx.config.timeouts.pipeline();
    let deadline = Instant::now() + limit;

    let app = &intent.application_name;
    let names = ResourceNames::for_app(app);
    let mut state = StateTracker::new(app.clone(), DeploymentState::Queued);
    let release = ReleaseManager::new(ctx, reporter);

    reporter
        .system(format!(
            "Starting deployment {} of {} from {}",
            intent.deployment_id, app, intent.git_repo
        ))
        .await;
    within(deadline, limit, release.ensure_namespace(&names)).await?;

    // Leftovers from an earlier deployment must not release this one
    let signal_queue = ctx.config.broker.signal_queue(app);
    within(deadline, limit, async {
        ctx.queue.clear(&signal_queue).await.map_err(Error::from)
    })
    .await?;

    let runner = BuildRunner::new(ctx);
    let build = within(deadline, limit, runner.submit(intent)).await?;
    state.advance(DeploymentState::BuildSubmitted);
    reporter
        .system(format!("Build job {} submitted", build.job_name))
        .await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let relay = LogRelay::new(
        ctx.provider.clone(),
        reporter.clone(),
        ctx.config.build.pod_poll_interval(),
        ctx.config.build.completion_timeout(),
    )
    .with_events(events_tx);
    let relay_task = tokio::spawn(relay.run_reporting(build.clone()));

    let waiter = CompletionWaiter::new(ctx.queue.clone(), ctx.config.build.completion_timeout());
    let completed = within(deadline, limit, async {
        let signal = waiter.wait(&signal_queue, &intent.deployment_id);
        tokio::pin!(signal);
        loop {
            tokio::select! {
                signal = &mut signal => break signal,
                Some(event) = events.recv() => match event {
                    RelayEvent::StageActive(stage) => {
                        state.advance(DeploymentState::BuildRunning(stage));
                    }
                    RelayEvent::Failed(err) => break Err(err),
                },
            }
        }
    })
    .await;

    if let Err(e) = completed {
        relay_task.abort();
        state.advance(DeploymentState::BuildFailed);
        runner.cleanup(&build).await;
        return Err(e);
    }

    // The relay keeps draining the last stage's log on its own
    state.advance(DeploymentState::BuildSucceeded);
    info!(app = %app, image = %build.image_reference, "Build completed");
    reporter
        .system(format!("Build completed: {}", build.image_reference))
        .await;

    let runtime_image = ctx.config.runtime_image(app, &intent.deployment_id);
    within(
        deadline,
        limit,
        release.release(intent, &runtime_image, &mut state),
    )
    .await
}

/// Tear down the application named by `intent`
pub async fn run_delete(
    ctx: &Context,
    reporter: &ProgressReporter,
    intent: &DeleteIntent,
) -> Result<()> {
    let app = &intent.application_name;
    let mut state = StateTracker::new(app.clone(), DeploymentState::Live);

    let mode = if intent.force { "forced" } else { "graceful" };
    reporter
        .system(format!("Starting {mode} deletion of {app}"))
        .await;

    if let Err(e) = DecommissionManager::new(ctx, reporter)
        .decommission(intent, &mut state)
        .await
    {
        warn!(app = %app, state = %state.current(), "Decommission stopped: {}", e);
        return Err(e);
    }

    reporter
        .system(format!("✅ Application {app} deleted"))
        .await;
    Ok(())
}
