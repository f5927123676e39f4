//! Controller Configuration
//!
//! Loaded from a mounted YAML file, then overridden from the environment by
//! the binaries. Every field has a default so a partial file is enough.

use kube::api::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;
use crate::intent::IntakeQueues;
use crate::wait::Backoff;

fn invalid(reason: impl Into<String>) -> Error {
    Error::Config(reason.into())
}

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Queue, signal and log bus settings
    pub broker: BrokerConfig,

    /// Build job settings
    pub build: BuildConfig,

    /// Runtime workload settings
    pub release: ReleaseConfig,

    /// Teardown settings
    pub decommission: DecommissionConfig,

    /// Wall-clock bounds for cluster calls and whole pipelines
    pub timeouts: TimeoutConfig,

    /// Intake loop settings
    pub intake: IntakeConfig,
}

/// Broker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Connection URL used by the controller itself
    pub url: String,

    pub create_queue: String,

    pub delete_queue: String,

    /// Completion signals for app `x` are pushed to `{prefix}x`
    pub signal_queue_prefix: String,

    /// Progress lines for app `x` are published on `{prefix}x`
    pub log_channel_prefix: String,

    /// Broker address as seen from build pods
    pub in_cluster_host: String,

    pub in_cluster_port: u16,

    /// Secret holding the broker password for the notify stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeyRef>,
}

/// Reference to one key of a Kubernetes Secret
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            create_queue: "create_queue".to_string(),
            delete_queue: "delete_queue".to_string(),
            signal_queue_prefix: "status:".to_string(),
            log_channel_prefix: "logs:".to_string(),
            in_cluster_host: "redis.default.svc.cluster.local".to_string(),
            in_cluster_port: 6379,
            password_secret: None,
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn intake_queues(&self) -> IntakeQueues<'_> {
        IntakeQueues {
            create: &self.create_queue,
            delete: &self.delete_queue,
        }
    }

    #[must_use]
    pub fn signal_queue(&self, application_name: &str) -> String {
        format!("{}{application_name}", self.signal_queue_prefix)
    }

    #[must_use]
    pub fn log_channel(&self, application_name: &str) -> String {
        format!("{}{application_name}", self.log_channel_prefix)
    }
}

/// Build job configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    /// Namespace the build jobs run in
    pub namespace: String,

    /// Registry the build pushes to, e.g. `registry.registry.svc:5000`
    pub registry: String,

    /// Job-level retry budget
    pub backoff_limit: i32,

    /// Finished jobs are garbage collected after this long
    pub ttl_seconds_after_finished: i32,

    pub fetch_image: String,

    pub builder_image: String,

    pub run_image: String,

    pub notifier_image: String,

    /// `CNB_PLATFORM_API` passed to the lifecycle
    pub platform_api: String,

    pub pod_poll_interval_ms: u64,

    /// Upper bound on waiting for the completion signal
    pub completion_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            namespace: "builder".to_string(),
            registry: String::new(),
            backoff_limit: 2,
            ttl_seconds_after_finished: 3600,
            fetch_image: "alpine/git:latest".to_string(),
            builder_image: "paketobuildpacks/builder-jammy-base:latest".to_string(),
            run_image: "paketobuildpacks/run-jammy-base:latest".to_string(),
            notifier_image: "redis:alpine".to_string(),
            platform_api: "0.11".to_string(),
            pod_poll_interval_ms: 1000,
            completion_timeout_secs: 1800,
        }
    }
}

impl BuildConfig {
    #[must_use]
    pub fn pod_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pod_poll_interval_ms)
    }

    #[must_use]
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

/// Runtime workload configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseConfig {
    /// Apps are exposed as `{app}.{domain}`
    pub domain: String,

    pub url_scheme: String,

    /// Registry address as seen by cluster nodes (defaults to the build registry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_host: Option<String>,

    pub replicas: i32,

    pub port: i32,

    pub resources: ResourceConfig,

    pub termination_grace_period_secs: i64,

    pub liveness_initial_delay_secs: i32,

    pub liveness_period_secs: i32,

    /// Upper bound on waiting for the service to get endpoints before the route is created
    pub service_settle_secs: u64,

    pub route: RouteResourceConfig,
}

/// Container requests and limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceConfig {
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_request: "125m".to_string(),
            memory_request: "256Mi".to_string(),
            cpu_limit: "500m".to_string(),
            memory_limit: "500Mi".to_string(),
        }
    }
}

/// Custom resource used for external routes
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteResourceConfig {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl Default for RouteResourceConfig {
    fn default() -> Self {
        Self {
            group: "traefik.io".to_string(),
            version: "v1alpha1".to_string(),
            kind: "IngressRoute".to_string(),
            plural: "ingressroutes".to_string(),
        }
    }
}

impl RouteResourceConfig {
    /// Dynamic API resource for the route kind
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            url_scheme: "http".to_string(),
            pull_host: None,
            replicas: 2,
            port: 8080,
            resources: ResourceConfig::default(),
            termination_grace_period_secs: 120,
            liveness_initial_delay_secs: 30,
            liveness_period_secs: 10,
            service_settle_secs: 10,
            route: RouteResourceConfig::default(),
        }
    }
}

impl ReleaseConfig {
    #[must_use]
    pub fn host_for(&self, application_name: &str) -> String {
        format!("{application_name}.{}", self.domain)
    }

    #[must_use]
    pub fn url_for(&self, application_name: &str) -> String {
        format!("{}://{}", self.url_scheme, self.host_for(application_name))
    }

    #[must_use]
    pub fn service_settle(&self) -> Duration {
        Duration::from_secs(self.service_settle_secs)
    }
}

/// Teardown configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecommissionConfig {
    /// Grace period given to workload pods on forced delete
    pub grace_period_secs: i64,

    /// Overall bound on a graceful decommission
    pub deadline_secs: u64,
}

impl Default for DecommissionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            deadline_secs: 60,
        }
    }
}

impl DecommissionConfig {
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Bound on every individual cluster call
    pub provider_call_secs: u64,

    /// Bound on a whole create or delete pipeline
    pub pipeline_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provider_call_secs: 30,
            pipeline_secs: 2700,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn provider_call(&self) -> Duration {
        Duration::from_secs(self.provider_call_secs)
    }

    #[must_use]
    pub fn pipeline(&self) -> Duration {
        Duration::from_secs(self.pipeline_secs)
    }
}

/// Intake loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntakeConfig {
    pub reconnect_initial_ms: u64,

    pub reconnect_max_ms: u64,

    /// Slice of one blocking pop; the loop checks for shutdown in between
    pub pop_timeout_secs: u64,

    /// How long shutdown waits for in-flight pipelines
    pub shutdown_grace_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            pop_timeout_secs: 5,
            shutdown_grace_secs: 30,
        }
    }
}

impl IntakeConfig {
    #[must_use]
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    #[must_use]
    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.build.registry.trim().is_empty() {
            return Err(invalid("build.registry must be set (or REGISTRY_URL provided)"));
        }

        if self.release.domain.trim().is_empty() {
            return Err(invalid("release.domain must be set (or APP_DOMAIN provided)"));
        }

        if self.broker.create_queue == self.broker.delete_queue {
            return Err(invalid("broker.createQueue and broker.deleteQueue must differ"));
        }

        if self.release.replicas < 1 {
            return Err(invalid("release.replicas must be at least 1"));
        }

        if !(1..=65535).contains(&self.release.port) {
            return Err(invalid(format!(
                "release.port {} is not a valid port",
                self.release.port
            )));
        }

        if self.build.pod_poll_interval_ms == 0 {
            return Err(invalid("build.podPollIntervalMs must be positive"));
        }

        if self.timeouts.provider_call_secs == 0
            || self.timeouts.pipeline_secs == 0
            || self.intake.pop_timeout_secs == 0
        {
            return Err(invalid("timeouts must be positive"));
        }

        // The build wait must be able to give up before the whole pipeline does
        if self.timeouts.pipeline_secs <= self.build.completion_timeout_secs {
            return Err(invalid(format!(
                "timeouts.pipelineSecs ({}) must exceed build.completionTimeoutSecs ({})",
                self.timeouts.pipeline_secs, self.build.completion_timeout_secs
            )));
        }

        if self.intake.reconnect_initial_ms == 0
            || self.intake.reconnect_max_ms < self.intake.reconnect_initial_ms
        {
            return Err(invalid(
                "intake.reconnectInitialMs must be positive and not exceed reconnectMaxMs",
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Registry address used in the runtime workload's image reference
    #[must_use]
    pub fn pull_registry(&self) -> &str {
        self.release
            .pull_host
            .as_deref()
            .filter(|host| !host.trim().is_empty())
            .unwrap_or(&self.build.registry)
    }

    /// Image reference the runtime workload pulls for one deployment
    #[must_use]
    pub fn runtime_image(&self, application_name: &str, deployment_id: &str) -> String {
        let registry = self.pull_registry().trim_end_matches('/');
        format!("{registry}/{application_name}:{deployment_id}")
    }
}
