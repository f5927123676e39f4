use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{AsyncBufReadExt, SinkExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use kube::Client;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{LogLines, ProviderError, WorkloadProvider};
use crate::config::RouteResourceConfig;

const LOG_BUFFER: usize = 256;

/// `WorkloadProvider` backed by the Kubernetes API
///
/// Every call is bounded by `call_timeout` so a hung API server cannot stall
/// a pipeline indefinitely.
#[derive(Clone)]
pub struct KubeProvider {
    client: Client,
    call_timeout: Duration,
    route_resource: ApiResource,
}

impl KubeProvider {
    #[must_use]
    pub fn new(client: Client, call_timeout: Duration, route: &RouteResourceConfig) -> Self {
        Self {
            client,
            call_timeout,
            route_resource: route.api_resource(),
        }
    }

    fn routes(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.route_resource)
    }

    async fn bounded<T, F>(&self, operation: String, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation,
                after: self.call_timeout,
            }),
        }
    }
}

/// Map 409/404 onto the variants the pipelines coerce
fn classify(err: kube::Error, kind: &'static str, name: &str) -> ProviderError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => ProviderError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 404 => ProviderError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) => ProviderError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => ProviderError::Kube(other),
    }
}

fn object_name(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

#[async_trait]
impl WorkloadProvider for KubeProvider {
    async fn create_namespace(&self, name: &str) -> Result<(), ProviderError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        }))?;

        self.bounded(format!("create namespace {name}"), async {
            namespaces
                .create(&PostParams::default(), &namespace)
                .await
                .map_err(|e| classify(e, "Namespace", name))?;
            info!("Created namespace: {}", name);
            Ok(())
        })
        .await
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ProviderError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        self.bounded(format!("delete namespace {name}"), async {
            namespaces
                .delete(name, &DeleteParams::default())
                .await
                .map_err(|e| classify(e, "Namespace", name))?;
            info!("Deleted namespace: {}", name);
            Ok(())
        })
        .await
    }

    async fn submit_job(&self, namespace: &str, job: &Job) -> Result<(), ProviderError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&job.metadata);

        self.bounded(format!("submit job {name}"), async {
            jobs.create(&PostParams::default(), job)
                .await
                .map_err(|e| classify(e, "Job", name))?;
            info!("Submitted build job: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ProviderError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);

        self.bounded(format!("delete job {name}"), async {
            jobs.delete(name, &DeleteParams::background())
                .await
                .map_err(|e| classify(e, "Job", name))?;
            debug!("Deleted job: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ProviderError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        self.bounded(format!("list pods {label_selector}"), async {
            let list = pods
                .list(&ListParams::default().labels(label_selector))
                .await
                .map_err(|e| classify(e, "Pod", label_selector))?;
            Ok(list.items)
        })
        .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ProviderError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        self.bounded(format!("get pod {name}"), async {
            pods.get(name).await.map_err(|e| classify(e, "Pod", name))
        })
        .await
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogLines, ProviderError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..LogParams::default()
        };
        let pod = pod.to_string();
        let call_timeout = self.call_timeout;
        let operation = format!("open log stream {pod}/{container}");

        // The reader borrows the Api, so it lives in its own task and lines
        // are handed over a channel.
        let (opened_tx, opened_rx) = oneshot::channel();
        let (mut line_tx, line_rx) = mpsc::channel(LOG_BUFFER);

        tokio::spawn(async move {
            let reader = match tokio::time::timeout(call_timeout, pods.log_stream(&pod, &params))
                .await
            {
                Ok(Ok(reader)) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Ok(Err(e)) => {
                    let _ = opened_tx.send(Err(classify(e, "Pod", &pod)));
                    return;
                }
                Err(_) => {
                    let _ = opened_tx.send(Err(ProviderError::Timeout {
                        operation,
                        after: call_timeout,
                    }));
                    return;
                }
            };

            let mut lines = Box::pin(reader.lines());
            while let Some(line) = lines.next().await {
                let item = line.map_err(|e| ProviderError::LogStream(e.to_string()));
                let broken = item.is_err();
                if line_tx.send(item).await.is_err() || broken {
                    break;
                }
            }
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(line_rx.boxed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::LogStream(
                "log reader exited before the stream opened".to_string(),
            )),
        }
    }

    async fn create_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), ProviderError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&deployment.metadata);

        self.bounded(format!("create workload {name}"), async {
            deployments
                .create(&PostParams::default(), deployment)
                .await
                .map_err(|e| classify(e, "Deployment", name))?;
            info!("Created deployment: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn replace_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), ProviderError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&deployment.metadata);

        self.bounded(format!("replace workload {name}"), async {
            // Fetch to preserve resourceVersion, then replace
            let existing = deployments
                .get(name)
                .await
                .map_err(|e| classify(e, "Deployment", name))?;
            let mut updated = deployment.clone();
            updated.metadata.resource_version = existing.metadata.resource_version;

            deployments
                .replace(name, &PostParams::default(), &updated)
                .await
                .map_err(|e| classify(e, "Deployment", name))?;
            info!("Updated deployment: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn scale_workload(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ProviderError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(json!({ "spec": { "replicas": replicas } }));

        self.bounded(format!("scale workload {name}"), async {
            deployments
                .patch_scale(name, &PatchParams::default(), &patch)
                .await
                .map_err(|e| classify(e, "Deployment", name))?;
            info!("Scaled deployment {}/{} to {} replicas", namespace, name, replicas);
            Ok(())
        })
        .await
    }

    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<i64>,
    ) -> Result<(), ProviderError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: grace_period_secs.and_then(|s| u32::try_from(s).ok()),
            ..DeleteParams::default()
        };

        self.bounded(format!("delete workload {name}"), async {
            deployments
                .delete(name, &params)
                .await
                .map_err(|e| classify(e, "Deployment", name))?;
            info!("Deleted deployment: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), ProviderError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&service.metadata);

        self.bounded(format!("create service {name}"), async {
            services
                .create(&PostParams::default(), service)
                .await
                .map_err(|e| classify(e, "Service", name))?;
            info!("Created service: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ProviderError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        self.bounded(format!("delete service {name}"), async {
            services
                .delete(name, &DeleteParams::default())
                .await
                .map_err(|e| classify(e, "Service", name))?;
            info!("Deleted service: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn service_has_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ProviderError> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);

        self.bounded(format!("get endpoints {name}"), async {
            match endpoints.get(name).await {
                Ok(ep) => Ok(ep.subsets.unwrap_or_default().iter().any(|subset| {
                    subset
                        .addresses
                        .as_ref()
                        .is_some_and(|addresses| !addresses.is_empty())
                })),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
                Err(e) => Err(classify(e, "Endpoints", name)),
            }
        })
        .await
    }

    async fn create_route(
        &self,
        namespace: &str,
        route: &DynamicObject,
    ) -> Result<(), ProviderError> {
        let routes = self.routes(namespace);
        let name = object_name(&route.metadata);

        self.bounded(format!("create route {name}"), async {
            routes
                .create(&PostParams::default(), route)
                .await
                .map_err(|e| classify(e, "Route", name))?;
            info!("Created route: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }

    async fn delete_route(&self, namespace: &str, name: &str) -> Result<(), ProviderError> {
        let routes = self.routes(namespace);

        self.bounded(format!("delete route {name}"), async {
            routes
                .delete(name, &DeleteParams::default())
                .await
                .map_err(|e| classify(e, "Route", name))?;
            info!("Deleted route: {}/{}", namespace, name);
            Ok(())
        })
        .await
    }
}
