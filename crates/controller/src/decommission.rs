//! Application teardown
//!
//! Forced: delete workload, service, route, namespace, stopping at the first
//! error. Graceful: scale to zero first, then delete route, service and
//! workload best-effort, and only delete the namespace once the workload is
//! really gone. "Not found" counts as deleted everywhere.

use std::future::Future;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::intent::DeleteIntent;
use crate::naming::ResourceNames;
use crate::progress::ProgressReporter;
use crate::provider::ProviderError;
use crate::state::{DecommissionStep, DeploymentState, StateTracker};

/// Whether a delete or scale result means "the resource is gone"
fn gone(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(ProviderError::NotFound { kind, name }) => {
            info!("{} {} already absent", kind, name);
            Ok(())
        }
        other => other,
    }
}

/// Tears down the runtime resources of one application
pub struct DecommissionManager<'a> {
    ctx: &'a Context,
    reporter: &'a ProgressReporter,
}

impl<'a> DecommissionManager<'a> {
    #[must_use]
    pub fn new(ctx: &'a Context, reporter: &'a ProgressReporter) -> Self {
        Self { ctx, reporter }
    }

    pub async fn decommission(&self, intent: &DeleteIntent, state: &mut StateTracker) -> Result<()> {
        let names = ResourceNames::for_app(&intent.application_name);

        if intent.force {
            self.forced(&names, state).await
        } else {
            self.graceful(&names, state).await
        }
    }

    async fn forced(&self, names: &ResourceNames, state: &mut StateTracker) -> Result<()> {
        let provider = &self.ctx.provider;
        let grace = self.ctx.config.decommission.grace_period_secs;
        state.advance(DeploymentState::Deleting);

        self.step(
            DecommissionStep::Workload,
            provider.delete_workload(&names.namespace, &names.workload, Some(grace)),
        )
        .await?;
        self.step(
            DecommissionStep::Service,
            provider.delete_service(&names.namespace, &names.service),
        )
        .await?;
        self.step(
            DecommissionStep::Route,
            provider.delete_route(&names.namespace, &names.route),
        )
        .await?;
        self.step(
            DecommissionStep::Namespace,
            provider.delete_namespace(&names.namespace),
        )
        .await?;

        state.advance(DeploymentState::Deleted);
        Ok(())
    }

    async fn graceful(&self, names: &ResourceNames, state: &mut StateTracker) -> Result<()> {
        let provider = &self.ctx.provider;
        let deadline = self.ctx.config.decommission.deadline();
        let expires = Instant::now() + deadline;
        state.advance(DeploymentState::Draining);

        self.reporter
            .system(format!("Scaling {} down to zero replicas", names.workload))
            .await;
        // A failed scale-down leaves the workload running untouched
        self.bounded_step(
            DecommissionStep::ScaleDown,
            expires,
            provider.scale_workload(&names.namespace, &names.workload, 0),
        )
        .await?;

        state.advance(DeploymentState::Deleting);

        for (step, result) in [
            (
                DecommissionStep::Route,
                self.bounded_step(
                    DecommissionStep::Route,
                    expires,
                    provider.delete_route(&names.namespace, &names.route),
                )
                .await,
            ),
            (
                DecommissionStep::Service,
                self.bounded_step(
                    DecommissionStep::Service,
                    expires,
                    provider.delete_service(&names.namespace, &names.service),
                )
                .await,
            ),
        ] {
            if let Err(e) = result {
                warn!("Continuing after failed {} deletion: {}", step, e);
                self.reporter
                    .system(format!("⚠️ Could not delete {step}: {e}"))
                    .await;
            }
        }

        // The namespace is only removed once the workload is known to be gone
        self.bounded_step(
            DecommissionStep::Workload,
            expires,
            provider.delete_workload(&names.namespace, &names.workload, None),
        )
        .await?;
        self.bounded_step(
            DecommissionStep::Namespace,
            expires,
            provider.delete_namespace(&names.namespace),
        )
        .await?;

        state.advance(DeploymentState::Deleted);
        Ok(())
    }

    async fn step<F>(&self, step: DecommissionStep, call: F) -> Result<()>
    where
        F: Future<Output = Result<(), ProviderError>>,
    {
        self.reporter.system(format!("Deleting {step}")).await;
        gone(call.await).map_err(|source| Error::DecommissionStepFailed { step, source })
    }

    /// `step`, but failing with a timeout once `expires` has passed
    async fn bounded_step<F>(&self, step: DecommissionStep, expires: Instant, call: F) -> Result<()>
    where
        F: Future<Output = Result<(), ProviderError>>,
    {
        let deadline = self.ctx.config.decommission.deadline();

        match tokio::time::timeout_at(expires, self.step(step, call)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DecommissionStepFailed {
                step,
                source: ProviderError::Timeout {
                    operation: format!("decommission {step}"),
                    after: deadline,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_counts_as_gone() {
        let result = gone(Err(ProviderError::NotFound {
            kind: "Service",
            name: "demo-service".to_string(),
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn test_other_errors_are_kept() {
        let result = gone(Err(ProviderError::Api {
            code: 500,
            message: "etcd unavailable".to_string(),
        }));
        assert!(matches!(result, Err(ProviderError::Api { code: 500, .. })));
    }
}
