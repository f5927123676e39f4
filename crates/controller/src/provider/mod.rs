//! Cluster workload provider
//!
//! Everything the pipelines need from the cluster, behind one trait so the
//! pipelines can be driven against an in-memory fake in tests.

mod kubernetes;

pub use kubernetes::KubeProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::DynamicObject;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during provider operations.
///
/// "Already exists" and "not found" get their own variants so callers can
/// coerce them to success with a `match` arm.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Create of an object that is already there.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Read, scale or delete of an object that is not there.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The call did not return within its wall-clock bound.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// API server rejected the request.
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Transport or client-side failure.
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// Object could not be built from its JSON description.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A log stream broke or could not be opened.
    #[error("Log stream error: {0}")]
    LogStream(String),
}

/// Line-by-line output of one container, in emission order
pub type LogLines = BoxStream<'static, Result<String, ProviderError>>;

/// Trait for the cluster backing the platform.
///
/// Create calls report `AlreadyExists`, delete and scale calls report
/// `NotFound`; it is up to the pipeline to decide whether those are errors.
#[async_trait]
pub trait WorkloadProvider: Send + Sync {
    /// Create a namespace.
    async fn create_namespace(&self, name: &str) -> Result<(), ProviderError>;

    /// Delete a namespace and everything in it.
    async fn delete_namespace(&self, name: &str) -> Result<(), ProviderError>;

    /// Submit a build job.
    async fn submit_job(&self, namespace: &str, job: &Job) -> Result<(), ProviderError>;

    /// Delete a job and its pods.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ProviderError>;

    /// List pods matching a label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<Pod>, ProviderError>;

    /// Get a pod by name.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ProviderError>;

    /// Follow the log of one container.
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogLines, ProviderError>;

    /// Create a workload.
    async fn create_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), ProviderError>;

    /// Replace an existing workload's spec, triggering a rolling update.
    async fn replace_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), ProviderError>;

    /// Set a workload's replica count.
    async fn scale_workload(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ProviderError>;

    /// Delete a workload, optionally overriding the pods' grace period.
    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<i64>,
    ) -> Result<(), ProviderError>;

    /// Create a service.
    async fn create_service(&self, namespace: &str, service: &Service)
        -> Result<(), ProviderError>;

    /// Delete a service.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ProviderError>;

    /// Whether the service has at least one ready endpoint.
    async fn service_has_endpoints(&self, namespace: &str, name: &str)
        -> Result<bool, ProviderError>;

    /// Create an external route.
    async fn create_route(&self, namespace: &str, route: &DynamicObject)
        -> Result<(), ProviderError>;

    /// Delete an external route.
    async fn delete_route(&self, namespace: &str, name: &str) -> Result<(), ProviderError>;
}
