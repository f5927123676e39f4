//! Human-readable progress lines on an application's log channel

use std::sync::Arc;
use tracing::warn;

use crate::broker::LogBus;
use crate::state::StageName;

pub const SYSTEM_TAG: &str = "SYSTEM";

/// Publishes `[TAG] text` lines to one application's channel
///
/// The log bus is a side channel: a failed publish is logged and otherwise
/// ignored so it never fails a pipeline.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<dyn LogBus>,
    channel: String,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(bus: Arc<dyn LogBus>, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Orchestrator progress: `[SYSTEM] message`
    pub async fn system(&self, message: impl AsRef<str>) {
        self.publish(&format_line(SYSTEM_TAG, message.as_ref())).await;
    }

    /// One relayed build line: `[FETCH] line`
    pub async fn stage(&self, stage: StageName, line: &str) {
        self.publish(&format_line(stage.tag(), line)).await;
    }

    async fn publish(&self, line: &str) {
        if let Err(e) = self.bus.publish(&self.channel, line).await {
            warn!(channel = %self.channel, "Failed to publish progress line: {}", e);
        }
    }
}

#[must_use]
pub fn format_line(tag: &str, text: &str) -> String {
    format!("[{tag}] {text}")
}
