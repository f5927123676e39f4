//! In-memory cluster, queue and log bus for driving pipelines in tests
//!
//! `FakeProvider` keeps a set of existing objects so create/delete answer
//! `AlreadyExists`/`NotFound` like a real API server, and records every call
//! in order.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::DynamicObject;
use launchpad_controller::provider::LogLines;
use launchpad_controller::{
    Context, ControllerConfig, LogBus, ProviderError, QueueError, WorkQueue, WorkloadProvider,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const DOMAIN: &str = "apps.example.com";

pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.build.registry = "registry.local:5000".to_string();
    config.build.pod_poll_interval_ms = 10;
    config.build.completion_timeout_secs = 60;
    config.release.domain = DOMAIN.to_string();
    config.release.service_settle_secs = 1;
    config
}

pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub queue: Arc<FakeQueue>,
    pub bus: Arc<RecordingBus>,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let provider = Arc::new(FakeProvider::default());
        let queue = Arc::new(FakeQueue::default());
        let bus = Arc::new(RecordingBus::default());
        let ctx = Context::new(
            provider.clone(),
            queue.clone(),
            bus.clone(),
            Arc::new(config),
        );
        Self {
            provider,
            queue,
            bus,
            ctx,
        }
    }
}

/// A build pod whose three stages all exited cleanly
pub fn completed_build_pod(name: &str) -> Pod {
    let done = |stage: &str| {
        json!({
            "name": stage, "image": "img", "imageID": "", "ready": false, "restartCount": 0,
            "state": { "terminated": { "exitCode": 0, "reason": "Completed" } }
        })
    };
    pod_with_status(
        name,
        json!({
            "phase": "Succeeded",
            "initContainerStatuses": [done("fetch"), done("build")],
            "containerStatuses": [done("notify")]
        }),
    )
}

pub fn pod_with_status(name: &str, status: serde_json::Value) -> Pod {
    serde_json::from_value(json!({
        "metadata": { "name": name, "namespace": "builder" },
        "status": status
    }))
    .unwrap()
}

pub fn ready_signal(app: &str, deployment: &str) -> String {
    json!({ "status": "ready", "app": app, "deployment": deployment, "timestamp": 1_700_000_000 })
        .to_string()
}

pub fn failed_signal(app: &str, deployment: &str, reason: &str) -> String {
    json!({
        "status": "failed", "app": app, "deployment": deployment,
        "timestamp": 1_700_000_000, "reason": reason
    })
    .to_string()
}

#[derive(Default)]
struct ProviderState {
    objects: HashSet<String>,
    calls: Vec<String>,
    failures: HashSet<&'static str>,
    panics: HashSet<&'static str>,
    delays: HashMap<&'static str, Duration>,
    log_failures: HashSet<String>,
    pod_script: VecDeque<Pod>,
    logs: HashMap<String, Vec<String>>,
    on_submit: Vec<(Arc<FakeQueue>, String, String)>,
}

/// Recording in-memory cluster
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    /// Pretend an object exists, e.g. `"workload/demo/demo"`
    pub fn seed(&self, key: &str) {
        self.state.lock().unwrap().objects.insert(key.to_string());
    }

    /// Seed every runtime object of `app`
    pub fn seed_app(&self, app: &str) {
        self.seed(&format!("namespace/{app}"));
        self.seed(&format!("workload/{app}/{app}"));
        self.seed(&format!("service/{app}/{app}-service"));
        self.seed(&format!("route/{app}/{app}-route"));
    }

    pub fn exists(&self, key: &str) -> bool {
        self.state.lock().unwrap().objects.contains(key)
    }

    /// Make every call of `operation` fail with a 500
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failures.insert(operation);
    }

    /// Make every call of `operation` panic, the way a bug in a step would
    pub fn panic_on(&self, operation: &'static str) {
        self.state.lock().unwrap().panics.insert(operation);
    }

    /// Make opening `container`'s log stream fail
    pub fn fail_logs(&self, container: &str) {
        self.state
            .lock()
            .unwrap()
            .log_failures
            .insert(container.to_string());
    }

    /// Make every call of `operation` take `delay` first
    pub fn delay(&self, operation: &'static str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(operation, delay);
    }

    /// Pods returned by successive `get_pod` calls; the last one sticks
    pub fn script_pods(&self, pods: Vec<Pod>) {
        self.state.lock().unwrap().pod_script = pods.into();
    }

    pub fn set_logs(&self, container: &str, lines: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(container.to_string(), lines.iter().map(|l| (*l).to_string()).collect());
    }

    /// Push `payload` onto `queue` when a build job is submitted, the way
    /// the notify stage would
    pub fn signal_on_submit(&self, queue: Arc<FakeQueue>, signal_queue: &str, payload: String) {
        self.state
            .lock()
            .unwrap()
            .on_submit
            .push((queue, signal_queue.to_string(), payload));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose operation is one of `operations`, in order
    pub fn calls_of(&self, operations: &[&str]) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                let op = call.split(' ').next().unwrap_or_default();
                operations.contains(&op)
            })
            .collect()
    }

    async fn enter(&self, operation: &'static str, target: String) -> Result<(), ProviderError> {
        let (delay, panics) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("{operation} {target}"));
            if state.failures.contains(operation) {
                return Err(ProviderError::Api {
                    code: 500,
                    message: format!("injected failure in {operation}"),
                });
            }
            (
                state.delays.get(operation).copied(),
                state.panics.contains(operation),
            )
        };
        // Outside the lock so the mutex is not poisoned
        if panics {
            panic!("injected panic in {operation} {target}");
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn create(&self, kind: &'static str, key: String, name: &str) -> Result<(), ProviderError> {
        if self.state.lock().unwrap().objects.insert(key) {
            Ok(())
        } else {
            Err(ProviderError::AlreadyExists {
                kind,
                name: name.to_string(),
            })
        }
    }

    fn remove(&self, kind: &'static str, key: &str, name: &str) -> Result<(), ProviderError> {
        if self.state.lock().unwrap().objects.remove(key) {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                kind,
                name: name.to_string(),
            })
        }
    }

    fn require(&self, kind: &'static str, key: &str, name: &str) -> Result<(), ProviderError> {
        if self.exists(key) {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                kind,
                name: name.to_string(),
            })
        }
    }
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl WorkloadProvider for FakeProvider {
    async fn create_namespace(&self, name: &str) -> Result<(), ProviderError> {
        self.enter("create_namespace", name.to_string()).await?;
        self.create("Namespace", format!("namespace/{name}"), name)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ProviderError> {
        self.enter("delete_namespace", name.to_string()).await?;
        self.remove("Namespace", &format!("namespace/{name}"), name)
    }

    async fn submit_job(&self, namespace: &str, job: &Job) -> Result<(), ProviderError> {
        let name = object_name(&job.metadata);
        self.enter("submit_job", format!("{namespace}/{name}")).await?;
        self.create("Job", format!("job/{namespace}/{name}"), &name)?;

        let signals = std::mem::take(&mut self.state.lock().unwrap().on_submit);
        for (queue, signal_queue, payload) in signals {
            queue.push_now(&signal_queue, &payload);
        }
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ProviderError> {
        self.enter("delete_job", format!("{namespace}/{name}")).await?;
        self.remove("Job", &format!("job/{namespace}/{name}"), name)
    }

    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state.pod_script.front().cloned().into_iter().collect())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let pod = if state.pod_script.len() > 1 {
            state.pod_script.pop_front()
        } else {
            state.pod_script.front().cloned()
        };
        pod.ok_or_else(|| ProviderError::NotFound {
            kind: "Pod",
            name: name.to_string(),
        })
    }

    async fn stream_logs(
        &self,
        _namespace: &str,
        _pod: &str,
        container: &str,
    ) -> Result<LogLines, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.log_failures.contains(container) {
            return Err(ProviderError::LogStream(format!(
                "container {container} is not available"
            )));
        }
        let lines = state.logs.get(container).cloned().unwrap_or_default();
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn create_workload(&self, namespace: &str, deployment: &Deployment) -> Result<(), ProviderError> {
        let name = object_name(&deployment.metadata);
        self.enter("create_workload", format!("{namespace}/{name}")).await?;
        self.create("Deployment", format!("workload/{namespace}/{name}"), &name)
    }

    async fn replace_workload(&self, namespace: &str, deployment: &Deployment) -> Result<(), ProviderError> {
        let name = object_name(&deployment.metadata);
        self.enter("replace_workload", format!("{namespace}/{name}")).await?;
        self.require("Deployment", &format!("workload/{namespace}/{name}"), &name)
    }

    async fn scale_workload(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), ProviderError> {
        self.enter("scale_workload", format!("{namespace}/{name}={replicas}")).await?;
        self.require("Deployment", &format!("workload/{namespace}/{name}"), name)
    }

    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_secs: Option<i64>,
    ) -> Result<(), ProviderError> {
        self.enter("delete_workload", format!("{namespace}/{name}")).await?;
        self.remove("Deployment", &format!("workload/{namespace}/{name}"), name)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), ProviderError> {
        let name = object_name(&service.metadata);
        self.enter("create_service", format!("{namespace}/{name}")).await?;
        self.create("Service", format!("service/{namespace}/{name}"), &name)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ProviderError> {
        self.enter("delete_service", format!("{namespace}/{name}")).await?;
        self.remove("Service", &format!("service/{namespace}/{name}"), name)
    }

    async fn service_has_endpoints(&self, namespace: &str, name: &str) -> Result<bool, ProviderError> {
        Ok(self.exists(&format!("service/{namespace}/{name}")))
    }

    async fn create_route(&self, namespace: &str, route: &DynamicObject) -> Result<(), ProviderError> {
        let name = object_name(&route.metadata);
        self.enter("create_route", format!("{namespace}/{name}")).await?;
        self.create("IngressRoute", format!("route/{namespace}/{name}"), &name)
    }

    async fn delete_route(&self, namespace: &str, name: &str) -> Result<(), ProviderError> {
        self.enter("delete_route", format!("{namespace}/{name}")).await?;
        self.remove("IngressRoute", &format!("route/{namespace}/{name}"), name)
    }
}

/// FIFO lists with a blocking pop
#[derive(Default)]
pub struct FakeQueue {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    failing_pops: AtomicUsize,
}

impl FakeQueue {
    /// Fail the next `count` pops as if the broker were down
    pub fn fail_pops(&self, count: usize) {
        self.failing_pops.store(count, Ordering::SeqCst);
    }

    pub fn push_now(&self, queue: &str, payload: &str) {
        self.lists
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.to_string());
        self.pushed.notify_waiters();
    }

    pub fn len(&self, queue: &str) -> usize {
        self.lists.lock().unwrap().get(queue).map_or(0, VecDeque::len)
    }

    fn try_pop(&self, queues: &[String]) -> Option<(String, String)> {
        let mut lists = self.lists.lock().unwrap();
        queues.iter().find_map(|queue| {
            lists
                .get_mut(queue)
                .and_then(VecDeque::pop_back)
                .map(|payload| (queue.clone(), payload))
        })
    }
}

#[async_trait]
impl WorkQueue for FakeQueue {
    async fn pop(
        &self,
        queues: &[String],
        timeout: Option<Duration>,
    ) -> Result<Option<(String, String)>, QueueError> {
        if self
            .failing_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Unavailable("connection refused".to_string()));
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let pushed = self.pushed.notified();
            if let Some(item) = self.try_pop(queues) {
                return Ok(Some(item));
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                        return Ok(None);
                    }
                }
                None => pushed.await,
            }
        }
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        self.push_now(queue, payload);
        Ok(())
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        self.lists.lock().unwrap().remove(queue);
        Ok(())
    }
}

/// Log bus that keeps every published line
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingBus {
    pub fn lines(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

#[async_trait]
impl LogBus for RecordingBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), QueueError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// Index of the first call starting with `prefix`
pub fn position(calls: &[String], prefix: &str) -> usize {
    calls
        .iter()
        .position(|call| call.starts_with(prefix))
        .unwrap_or_else(|| panic!("no call starting with {prefix:?} in {calls:?}"))
}
