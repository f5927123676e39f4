//! Build Job construction and submission

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{EnvVar, VolumeMount};
use serde_json::json;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::intent::DeployIntent;
use crate::naming::ResourceNaming;
use crate::provider::ProviderError;
use crate::state::StageName;

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";
const MANAGED_BY: &str = "launchpad";

/// One container of the build pod
#[derive(Debug, Clone, PartialEq)]
pub struct BuildStage {
    pub name: StageName,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub volume_mounts: Vec<VolumeMount>,
}

/// Description of the build Job for one deployment
///
/// Stages run in order: `fetch` and `build` as init containers, `notify` as
/// the pod's only regular container, all sharing one emptyDir workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildJobSpec {
    pub job_name: String,
    pub namespace: String,
    pub application_name: String,
    pub deployment_id: String,
    pub image_reference: String,
    pub cache_image: String,
    pub stages: Vec<BuildStage>,
    pub backoff_limit: i32,
    pub ttl_seconds_after_finished: i32,
}

impl BuildJobSpec {
    #[must_use]
    pub fn for_intent(intent: &DeployIntent, config: &ControllerConfig) -> Self {
        let app = &intent.application_name;
        let registry = config.build.registry.trim_end_matches('/');
        let image_reference = format!("{registry}/{app}:{}", intent.deployment_id);
        let cache_image = format!("{registry}/{app}:cache");

        let stages = vec![
            fetch_stage(intent, config),
            build_stage(&image_reference, &cache_image, config),
            notify_stage(intent, config),
        ];

        Self {
            job_name: ResourceNaming::build_job_name(app, &intent.deployment_id),
            namespace: config.build.namespace.clone(),
            application_name: app.clone(),
            deployment_id: intent.deployment_id.clone(),
            image_reference,
            cache_image,
            stages,
            backoff_limit: config.build.backoff_limit,
            ttl_seconds_after_finished: config.build.ttl_seconds_after_finished,
        }
    }

    #[must_use]
    pub fn stage(&self, name: StageName) -> Option<&BuildStage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Render as a batch/v1 Job
    pub fn to_job(&self) -> Result<Job, serde_json::Error> {
        let container = |stage: &BuildStage| {
            json!({
                "name": stage.name.as_str(),
                "image": stage.image,
                "imagePullPolicy": "IfNotPresent",
                "command": stage.command,
                "env": stage.env,
                "volumeMounts": stage.volume_mounts
            })
        };

        let (init, main): (Vec<&BuildStage>, Vec<&BuildStage>) = self
            .stages
            .iter()
            .partition(|stage| stage.name != StageName::Notify);

        let labels = json!({
            "app.kubernetes.io/managed-by": MANAGED_BY,
            "launchpad.dev/app": self.application_name,
            "launchpad.dev/deployment": self.deployment_id,
        });

        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.job_name,
                "namespace": self.namespace,
                "labels": labels
            },
            "spec": {
                "backoffLimit": self.backoff_limit,
                "ttlSecondsAfterFinished": self.ttl_seconds_after_finished,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "volumes": [{ "name": WORKSPACE_VOLUME, "emptyDir": {} }],
                        "initContainers": init.into_iter().map(container).collect::<Vec<_>>(),
                        "containers": main.into_iter().map(container).collect::<Vec<_>>()
                    }
                }
            }
        }))
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn workspace_mount() -> Vec<VolumeMount> {
    vec![VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_PATH.to_string(),
        ..VolumeMount::default()
    }]
}

fn fetch_stage(intent: &DeployIntent, config: &ControllerConfig) -> BuildStage {
    // argv, not a shell line: the URL never goes through sh
    BuildStage {
        name: StageName::Fetch,
        image: config.build.fetch_image.clone(),
        command: vec![
            "git".to_string(),
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            intent.git_repo.clone(),
            WORKSPACE_PATH.to_string(),
        ],
        env: Vec::new(),
        volume_mounts: workspace_mount(),
    }
}

fn build_stage(image_reference: &str, cache_image: &str, config: &ControllerConfig) -> BuildStage {
    // A missing cache image is a cold build, not an error
    BuildStage {
        name: StageName::Build,
        image: config.build.builder_image.clone(),
        command: vec![
            "/cnb/lifecycle/creator".to_string(),
            format!("-app={WORKSPACE_PATH}"),
            format!("-cache-image={cache_image}"),
            format!("-run-image={}", config.build.run_image),
            "-skip-restore=false".to_string(),
            image_reference.to_string(),
        ],
        env: vec![env("CNB_PLATFORM_API", &config.build.platform_api)],
        volume_mounts: workspace_mount(),
    }
}

/// Shell script run by the notify stage
///
/// Values come in through the environment; the timestamp is taken when the
/// stage actually runs.
pub const NOTIFY_SCRIPT: &str = r#"redis-cli -h "$BROKER_HOST" -p "$BROKER_PORT" LPUSH "$SIGNAL_QUEUE" "{\"status\":\"ready\",\"app\":\"$APP_NAME\",\"deployment\":\"$DEPLOYMENT_ID\",\"timestamp\":$(date +%s)}""#;

fn notify_stage(intent: &DeployIntent, config: &ControllerConfig) -> BuildStage {
    let broker = &config.broker;
    let mut env_vars = vec![
        env("BROKER_HOST", &broker.in_cluster_host),
        env("BROKER_PORT", broker.in_cluster_port.to_string()),
        env("SIGNAL_QUEUE", broker.signal_queue(&intent.application_name)),
        env("APP_NAME", &intent.application_name),
        env("DEPLOYMENT_ID", &intent.deployment_id),
    ];

    let auth = broker.password_secret.as_ref().and_then(|secret| {
        serde_json::from_value::<EnvVar>(json!({
            "name": "REDISCLI_AUTH",
            "valueFrom": { "secretKeyRef": { "name": secret.name, "key": secret.key } }
        }))
        .ok()
    });
    env_vars.extend(auth);

    BuildStage {
        name: StageName::Notify,
        image: config.build.notifier_image.clone(),
        command: vec!["sh".to_string(), "-c".to_string(), NOTIFY_SCRIPT.to_string()],
        env: env_vars,
        volume_mounts: workspace_mount(),
    }
}

/// Identity of a submitted build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBuild {
    pub job_name: String,
    pub namespace: String,
    pub image_reference: String,
}

impl SubmittedBuild {
    #[must_use]
    pub fn pod_selector(&self) -> String {
        ResourceNaming::job_pod_selector(&self.job_name)
    }
}

/// Builds and submits build Jobs
pub struct BuildRunner<'a> {
    ctx: &'a Context,
}

impl<'a> BuildRunner<'a> {
    #[must_use]
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn plan(&self, intent: &DeployIntent) -> BuildJobSpec {
        BuildJobSpec::for_intent(intent, &self.ctx.config)
    }

    /// Submit the build Job for `intent`
    ///
    /// A Job with the same name can only come from the same deployment being
    /// queued twice, so it is adopted rather than treated as a failure.
    pub async fn submit(&self, intent: &DeployIntent) -> Result<SubmittedBuild> {
        let spec = self.plan(intent);
        let job = spec.to_job().map_err(ProviderError::from)?;

        match self.ctx.provider.submit_job(&spec.namespace, &job).await {
            Ok(()) => info!("Submitted build job {} for {}", spec.job_name, spec.image_reference),
            Err(ProviderError::AlreadyExists { .. }) => {
                warn!("Build job {} already exists, following it", spec.job_name);
            }
            Err(e) => return Err(Error::Provider(e)),
        }

        Ok(SubmittedBuild {
            job_name: spec.job_name,
            namespace: spec.namespace,
            image_reference: spec.image_reference,
        })
    }

    /// Best-effort removal of a failed or abandoned build
    pub async fn cleanup(&self, build: &SubmittedBuild) {
        match self
            .ctx
            .provider
            .delete_job(&build.namespace, &build.job_name)
            .await
        {
            Ok(()) | Err(ProviderError::NotFound { .. }) => {}
            Err(e) => warn!("Failed to delete build job {}: {}", build.job_name, e),
        }
    }
}
