//! Shared capabilities handed to every pipeline task

use std::sync::Arc;

use crate::broker::{LogBus, WorkQueue};
use crate::config::ControllerConfig;
use crate::lease::AppLeases;
use crate::progress::ProgressReporter;
use crate::provider::WorkloadProvider;

/// Context shared across pipeline tasks
///
/// Cloning is cheap; the capabilities are reference counted and safe for
/// concurrent use.
#[derive(Clone)]
pub struct Context {
    pub provider: Arc<dyn WorkloadProvider>,
    pub queue: Arc<dyn WorkQueue>,
    pub bus: Arc<dyn LogBus>,
    pub config: Arc<ControllerConfig>,
    pub leases: AppLeases,
}

impl Context {
    #[must_use]
    pub fn new(
        provider: Arc<dyn WorkloadProvider>,
        queue: Arc<dyn WorkQueue>,
        bus: Arc<dyn LogBus>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            provider,
            queue,
            bus,
            config,
            leases: AppLeases::new(),
        }
    }

    /// Reporter for `logs:{application_name}`
    #[must_use]
    pub fn reporter_for(&self, application_name: &str) -> ProgressReporter {
        ProgressReporter::new(
            self.bus.clone(),
            self.config.broker.log_channel(application_name),
        )
    }
}
