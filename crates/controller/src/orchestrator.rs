//! Intake loop
//!
//! Pops intents off the create and delete queues one at a time and hands each
//! to its own supervised pipeline task, then goes straight back to popping.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::intent::Intent;
use crate::pipeline;
use crate::supervisor::spawn_supervised;

/// Dispatches queued intents to pipeline tasks
pub struct Orchestrator {
    ctx: Context,
    tracker: TaskTracker,
}

impl Orchestrator {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            tracker: TaskTracker::new(),
        }
    }

    /// Run until `shutdown` is cancelled, then wait (bounded) for in-flight
    /// pipelines
    ///
    /// Broker failures never end the loop; they are retried with capped
    /// exponential backoff.
    pub async fn run(&self, shutdown: CancellationToken) {
        let broker = &self.ctx.config.broker;
        let intake = &self.ctx.config.intake;
        let queues = [broker.create_queue.clone(), broker.delete_queue.clone()];
        let mut backoff = intake.reconnect_backoff();

        info!(
            create_queue = %broker.create_queue,
            delete_queue = %broker.delete_queue,
            "Orchestrator started"
        );

        loop {
            let popped = tokio::select! {
                () = shutdown.cancelled() => break,
                popped = self.ctx.queue.pop(&queues, Some(intake.pop_timeout())) => popped,
            };

            match popped {
                Ok(Some((queue, payload))) => {
                    backoff.reset();
                    self.dispatch(&queue, &payload).await;
                }
                Ok(None) => {}
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("Work queue unavailable, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.drain(intake.shutdown_grace()).await;
    }

    async fn dispatch(&self, queue: &str, payload: &str) {
        let intent = match Intent::decode(queue, payload, self.ctx.config.broker.intake_queues()) {
            Ok(intent) => intent,
            Err(e) => {
                warn!("Dropping work item: {}", e);
                // Tell the app's watchers, if the payload names one
                if let Some(app) = application_name_hint(payload) {
                    self.ctx
                        .reporter_for(&app)
                        .system(format!("❌ Request rejected: {e}"))
                        .await;
                }
                return;
            }
        };

        let app = intent.application_name().to_string();
        let kind = intent.kind();
        debug!(app = %app, kind, "Dispatching intent");

        spawn_supervised(
            &self.tracker,
            self.ctx.reporter_for(&app),
            app,
            kind,
            pipeline::run_intent(self.ctx.clone(), intent),
        );
    }

    async fn drain(&self, grace: Duration) {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending == 0 {
            info!("Orchestrator stopped");
            return;
        }

        info!("Waiting up to {:?} for {} pipeline(s) to finish", grace, pending);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            error!(
                "{} pipeline(s) still running after {:?}, abandoning them",
                self.tracker.len(),
                grace
            );
        } else {
            info!("Orchestrator stopped");
        }
    }
}

/// Best-effort application name from a payload that failed to decode
fn application_name_hint(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    ["appName", "appname"]
        .iter()
        .find_map(|key| value.get(*key)?.as_str())
        .filter(|name| crate::intent::validate_app_name(name).is_ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_name_hint() {
        assert_eq!(
            application_name_hint(r#"{"appName":"demo","DepId":"BAD ID"}"#).as_deref(),
            Some("demo")
        );
        assert_eq!(
            application_name_hint(r#"{"appname":"demo"}"#).as_deref(),
            Some("demo")
        );
        assert_eq!(application_name_hint(r#"{"appName":"Not Valid"}"#), None);
        assert_eq!(application_name_hint("not json"), None);
    }
}
