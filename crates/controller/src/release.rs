//! Runtime resources for a built image
//!
//! Namespace, workload, service and route are created strictly in that order,
//! each gated on the previous one. Nothing is rolled back on failure; a later
//! delete intent cleans up.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::DynamicObject;
use serde_json::json;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::intent::DeployIntent;
use crate::naming::ResourceNames;
use crate::progress::ProgressReporter;
use crate::provider::ProviderError;
use crate::state::{DeploymentState, ReleaseRecord, ReleaseStep, StateTracker};
use crate::wait::{poll_until, PollPolicy, Check, WaitError};

const CONTAINER_NAME: &str = "dep";
const SETTLE_POLL_INTERVAL_MS: u64 = 500;

/// Runtime workload for `image_reference`
pub fn workload_spec(
    names: &ResourceNames,
    application_name: &str,
    image_reference: &str,
    config: &ControllerConfig,
) -> Result<Deployment, serde_json::Error> {
    let release = &config.release;
    let labels = json!({ "app": application_name });

    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": names.workload,
            "namespace": names.namespace,
            "labels": labels
        },
        "spec": {
            "replicas": release.replicas,
            "selector": { "matchLabels": labels },
            "strategy": {
                "type": "RollingUpdate",
                "rollingUpdate": { "maxSurge": 1, "maxUnavailable": 0 }
            },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "terminationGracePeriodSeconds": release.termination_grace_period_secs,
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": image_reference,
                        "ports": [{ "containerPort": release.port }],
                        "resources": {
                            "requests": {
                                "cpu": release.resources.cpu_request,
                                "memory": release.resources.memory_request
                            },
                            "limits": {
                                "cpu": release.resources.cpu_limit,
                                "memory": release.resources.memory_limit
                            }
                        },
                        "livenessProbe": {
                            "tcpSocket": { "port": release.port },
                            "initialDelaySeconds": release.liveness_initial_delay_secs,
                            "periodSeconds": release.liveness_period_secs
                        }
                    }]
                }
            }
        }
    }))
}

/// Internal service selecting the workload's pods
pub fn service_spec(
    names: &ResourceNames,
    application_name: &str,
    config: &ControllerConfig,
) -> Result<Service, serde_json::Error> {
    let port = config.release.port;

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": names.service,
            "namespace": names.namespace,
            "labels": { "app": application_name }
        },
        "spec": {
            "selector": { "app": application_name },
            "ports": [{ "name": "http", "port": port, "targetPort": port }]
        }
    }))
}

/// External route binding `{app}.{domain}` to the service
#[must_use]
pub fn route_spec(names: &ResourceNames, host: &str, config: &ControllerConfig) -> DynamicObject {
    let resource = config.release.route.api_resource();

    DynamicObject::new(&names.route, &resource)
        .within(&names.namespace)
        .data(json!({
            "spec": {
                "routes": [{
                    "match": format!("Host(`{host}`)"),
                    "kind": "Rule",
                    "services": [{ "name": names.service, "port": config.release.port }]
                }]
            }
        }))
}

/// Creates the runtime resources of one application
pub struct ReleaseManager<'a> {
    ctx: &'a Context,
    reporter: &'a ProgressReporter,
}

impl<'a> ReleaseManager<'a> {
    #[must_use]
    pub fn new(ctx: &'a Context, reporter: &'a ProgressReporter) -> Self {
        Self { ctx, reporter }
    }

    /// Create the per-application namespace; an existing one is fine
    pub async fn ensure_namespace(&self, names: &ResourceNames) -> Result<()> {
        match self.ctx.provider.create_namespace(&names.namespace).await {
            Ok(()) => Ok(()),
            Err(ProviderError::AlreadyExists { .. }) => {
                info!("Namespace {} already exists", names.namespace);
                Ok(())
            }
            Err(source) => Err(Error::ReleaseStepFailed {
                step: ReleaseStep::Namespace,
                source,
            }),
        }
    }

    pub async fn release(
        &self,
        intent: &DeployIntent,
        image_reference: &str,
        state: &mut StateTracker,
    ) -> Result<ReleaseRecord> {
        let app = &intent.application_name;
        let config = &self.ctx.config;
        let names = ResourceNames::for_app(app);

        state.advance(DeploymentState::Releasing(ReleaseStep::Namespace));
        self.ensure_namespace(&names).await?;

        state.advance(DeploymentState::Releasing(ReleaseStep::Workload));
        self.reporter
            .system(format!("Creating deployment {} with image {image_reference}", names.workload))
            .await;
        self.apply_workload(&names, app, image_reference).await?;

        state.advance(DeploymentState::Releasing(ReleaseStep::Service));
        self.reporter
            .system(format!("Creating service {}", names.service))
            .await;
        self.create_service(&names, app).await?;
        self.settle_service(&names).await;

        state.advance(DeploymentState::Releasing(ReleaseStep::Route));
        let host = config.release.host_for(app);
        self.reporter
            .system(format!("Creating route {} for {host}", names.route))
            .await;
        self.create_route(&names, &host).await?;

        let url = config.release.url_for(app);
        state.advance(DeploymentState::Live);
        self.reporter
            .system(format!("🎉 SUCCESS! Your app is live at: {url}"))
            .await;

        Ok(ReleaseRecord {
            application_name: app.clone(),
            image_reference: image_reference.to_string(),
            names,
            url,
            history: state.history().to_vec(),
        })
    }

    /// Create the workload, or roll the existing one to the new image
    async fn apply_workload(
        &self,
        names: &ResourceNames,
        application_name: &str,
        image_reference: &str,
    ) -> Result<()> {
        let failed = |source: ProviderError| Error::ReleaseStepFailed {
            step: ReleaseStep::Workload,
            source,
        };
        let deployment = workload_spec(names, application_name, image_reference, &self.ctx.config)
            .map_err(|e| failed(e.into()))?;

        match self
            .ctx
            .provider
            .create_workload(&names.namespace, &deployment)
            .await
        {
            Ok(()) => Ok(()),
            Err(ProviderError::AlreadyExists { .. }) => {
                info!("Deployment {} exists, rolling it to {}", names.workload, image_reference);
                self.ctx
                    .provider
                    .replace_workload(&names.namespace, &deployment)
                    .await
                    .map_err(failed)
            }
            Err(e) => Err(failed(e)),
        }
    }

    async fn create_service(&self, names: &ResourceNames, application_name: &str) -> Result<()> {
        let failed = |source: ProviderError| Error::ReleaseStepFailed {
            step: ReleaseStep::Service,
            source,
        };
        let service =
            service_spec(names, application_name, &self.ctx.config).map_err(|e| failed(e.into()))?;

        match self
            .ctx
            .provider
            .create_service(&names.namespace, &service)
            .await
        {
            Ok(()) | Err(ProviderError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(failed(e)),
        }
    }

    /// Give the service a bounded chance to get endpoints before routing to it
    ///
    /// A route created too early can 404 until endpoints propagate. This is a
    /// soft dependency: on timeout the release carries on.
    async fn settle_service(&self, names: &ResourceNames) {
        let settle = self.ctx.config.release.service_settle();
        if settle.is_zero() {
            return;
        }

        let policy = PollPolicy::fixed(std::time::Duration::from_millis(SETTLE_POLL_INTERVAL_MS))
            .with_deadline(settle);
        let (provider, namespace, service) =
            (&self.ctx.provider, names.namespace.as_str(), names.service.as_str());

        let settled: Result<(), WaitError<()>> = poll_until(policy, || async move {
            match provider.service_has_endpoints(namespace, service).await {
                Ok(true) => Check::Ready(()),
                _ => Check::Pending,
            }
        })
        .await;

        if settled.is_err() {
            warn!(
                "Service {} has no ready endpoints after {:?}, creating route anyway",
                names.service, settle
            );
        }
    }

    async fn create_route(&self, names: &ResourceNames, host: &str) -> Result<()> {
        let route = route_spec(names, host, &self.ctx.config);

        match self
            .ctx
            .provider
            .create_route(&names.namespace, &route)
            .await
        {
            Ok(()) | Err(ProviderError::AlreadyExists { .. }) => Ok(()),
            Err(source) => Err(Error::ReleaseStepFailed {
                step: ReleaseStep::Route,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.build.registry = "registry.local:5000".to_string();
        config.release.domain = "apps.example.com".to_string();
        config
    }

    #[test]
    fn test_workload_spec() {
        let names = ResourceNames::for_app("demo");
        let deployment =
            workload_spec(&names, "demo", "registry.local:5000/demo:dep-1", &config()).unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("demo"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("demo"));

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.unwrap().get("app").map(String::as_str),
            Some("demo")
        );

        let rolling = spec.strategy.unwrap().rolling_update.unwrap();
        assert_eq!(
            rolling.max_surge,
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(1))
        );
        assert_eq!(
            rolling.max_unavailable,
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(0))
        );

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.termination_grace_period_seconds, Some(120));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local:5000/demo:dep-1"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
        assert!(container.liveness_probe.as_ref().unwrap().tcp_socket.is_some());
    }

    #[test]
    fn test_service_spec() {
        let names = ResourceNames::for_app("demo");
        let service = service_spec(&names, "demo", &config()).unwrap();

        assert_eq!(service.metadata.name.as_deref(), Some("demo-service"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.selector.unwrap().get("app").map(String::as_str), Some("demo"));
        assert_eq!(spec.ports.unwrap()[0].port, 8080);
    }

    #[test]
    fn test_route_spec() {
        let names = ResourceNames::for_app("demo");
        let route = route_spec(&names, "demo.apps.example.com", &config());

        assert_eq!(route.metadata.name.as_deref(), Some("demo-route"));
        assert_eq!(route.metadata.namespace.as_deref(), Some("demo"));
        assert_eq!(
            route.types.as_ref().map(|t| t.api_version.as_str()),
            Some("traefik.io/v1alpha1")
        );
        assert_eq!(
            route.data["spec"]["routes"][0]["match"],
            "Host(`demo.apps.example.com`)"
        );
        assert_eq!(route.data["spec"]["routes"][0]["services"][0]["name"], "demo-service");
    }
}
