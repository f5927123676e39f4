//! Build completion wait

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::WorkQueue;
use crate::error::{Error, Result};
use crate::intent::CompletionSignal;

/// Waits on an application's signal queue for its build to report back
pub struct CompletionWaiter {
    queue: Arc<dyn WorkQueue>,
    timeout: Duration,
}

impl CompletionWaiter {
    #[must_use]
    pub fn new(queue: Arc<dyn WorkQueue>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    /// Block until the signal for `deployment_id` arrives on `signal_queue`
    ///
    /// Only a `"ready"` status succeeds. Signals stamped with another
    /// deployment are dropped; a payload that does not decode is a failed
    /// build. Gives up with `BuildTimeout` once the timeout has passed.
    pub async fn wait(&self, signal_queue: &str, deployment_id: &str) -> Result<CompletionSignal> {
        let deadline = Instant::now() + self.timeout;
        let queues = [signal_queue.to_string()];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::BuildTimeout(self.timeout));
            }

            let Some((_, payload)) = self.queue.pop(&queues, Some(remaining)).await? else {
                continue;
            };

            let signal: CompletionSignal = serde_json::from_str(&payload).map_err(|e| {
                Error::build_failed(None, format!("malformed completion signal: {e}"))
            })?;

            if !signal.matches_deployment(deployment_id) {
                warn!(
                    queue = %signal_queue,
                    "Discarding completion signal for deployment {:?}",
                    signal.deployment_id
                );
                continue;
            }

            debug!(queue = %signal_queue, status = %signal.status, "Received completion signal");

            if signal.is_ready() {
                return Ok(signal);
            }

            let reason = signal
                .reason
                .clone()
                .unwrap_or_else(|| format!("build reported status '{}'", signal.status));
            return Err(Error::build_failed(None, reason));
        }
    }
}
