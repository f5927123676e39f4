use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const BUILD_JOB_PREFIX: &str = "build-";
const SERVICE_SUFFIX: &str = "-service";
const ROUTE_SUFFIX: &str = "-route";

/// Names of every cluster object that belongs to one application.
///
/// The namespace is derived 1:1 from the application name, which makes the
/// application name the unit of isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub namespace: String,
    pub workload: String,
    pub service: String,
    pub route: String,
}

impl ResourceNames {
    #[must_use]
    pub fn for_app(application_name: &str) -> Self {
        Self {
            namespace: application_name.to_string(),
            workload: application_name.to_string(),
            service: format!("{application_name}{SERVICE_SUFFIX}"),
            route: format!("{application_name}{ROUTE_SUFFIX}"),
        }
    }
}

pub struct ResourceNaming;

impl ResourceNaming {
    /// Build job name: `build-{app}{deploymentId}`
    ///
    /// The Job controller copies the name into the pod's `job-name` label, so
    /// it has to stay within the 63 character label limit. Longer names keep
    /// their prefix and get a deterministic hash suffix.
    #[must_use]
    pub fn build_job_name(application_name: &str, deployment_id: &str) -> String {
        let name = format!("{BUILD_JOB_PREFIX}{application_name}{deployment_id}");
        Self::ensure_k8s_name_length(&name, MAX_K8S_NAME_LENGTH)
    }

    /// Label selector matching the pods of a build job
    #[must_use]
    pub fn job_pod_selector(job_name: &str) -> String {
        format!("job-name={job_name}")
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }

        let hash = Self::hash_string(name);
        let keep = limit.saturating_sub(hash.len() + 1);
        let prefix = name[..keep].trim_end_matches('-');
        format!("{prefix}-{hash}")
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:08x}", hasher.finish() & 0xffff_ffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_job_name_matches_wire_format() {
        assert_eq!(
            ResourceNaming::build_job_name("demo", "dep-1"),
            "build-demodep-1"
        );
    }

    #[test]
    fn test_long_build_job_name_is_truncated_deterministically() {
        let app = "a".repeat(60);
        let first = ResourceNaming::build_job_name(&app, "dep-abcdefgh");
        let second = ResourceNaming::build_job_name(&app, "dep-abcdefgh");

        assert_eq!(first, second);
        assert!(first.len() <= MAX_K8S_NAME_LENGTH);
        assert!(first.starts_with("build-aaaa"));

        let other = ResourceNaming::build_job_name(&app, "dep-zzzzzzzz");
        assert_ne!(first, other);
    }

    #[test]
    fn test_resource_names_for_app() {
        let names = ResourceNames::for_app("demo");
        assert_eq!(names.namespace, "demo");
        assert_eq!(names.workload, "demo");
        assert_eq!(names.service, "demo-service");
        assert_eq!(names.route, "demo-route");
    }

    #[test]
    fn test_job_pod_selector() {
        assert_eq!(
            ResourceNaming::job_pod_selector("build-demodep-1"),
            "job-name=build-demodep-1"
        );
    }
}
