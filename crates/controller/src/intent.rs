//! Queued intents and the build completion signal
//!
//! Payloads arrive as JSON on broker lists. The variant is chosen by the list
//! the payload was popped from, never by guessing from the payload's shape.

use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_APP_NAME_LENGTH: usize = 63;
const MAX_DEPLOYMENT_ID_LENGTH: usize = 40;

lazy_static! {
    /// DNS-1123 label: the app name doubles as the namespace name
    static ref APP_NAME_RE: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
    static ref DEPLOYMENT_ID_RE: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
    static ref GIT_URL_RE: Regex =
        Regex::new(r"^((https?|git|ssh)://[^\s]+|[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[^\s]+)$").unwrap();
}

/// Request to build and release a repository under an application name
///
/// `application_name` is the stable identity of the app across re-deploys;
/// `deployment_id` distinguishes one build/release of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployIntent {
    #[serde(rename = "gitrepo")]
    pub git_repo: String,

    #[serde(rename = "DepId", alias = "depid")]
    pub deployment_id: String,

    #[serde(rename = "appName", alias = "appname")]
    pub application_name: String,
}

/// Request to tear an application down
///
/// Every field is required and nothing else is accepted, so a create
/// payload pushed onto the delete list can never pass as a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteIntent {
    #[serde(rename = "userId", alias = "userid")]
    pub user_id: String,

    #[serde(rename = "appname", alias = "appName")]
    pub application_name: String,

    /// `true` deletes immediately, `false` drains by scaling to zero first
    pub force: bool,
}

/// A decoded work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Create(DeployIntent),
    Delete(DeleteIntent),
}

/// Names of the two intake lists
#[derive(Debug, Clone, Copy)]
pub struct IntakeQueues<'a> {
    pub create: &'a str,
    pub delete: &'a str,
}

impl Intent {
    /// Decode a payload popped from `queue`
    ///
    /// Returns `Error::PayloadMalformed` when the queue is unknown, the JSON
    /// does not match the queue's payload shape, or a field fails validation.
    pub fn decode(queue: &str, payload: &str, queues: IntakeQueues<'_>) -> Result<Self> {
        let malformed = |reason: String| Error::PayloadMalformed {
            queue: queue.to_string(),
            reason,
        };

        let intent = if queue == queues.create {
            let intent: DeployIntent =
                serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
            Self::Create(intent)
        } else if queue == queues.delete {
            let intent: DeleteIntent =
                serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
            Self::Delete(intent)
        } else {
            return Err(malformed("unknown intake queue".to_string()));
        };

        intent.validate().map_err(malformed)?;
        Ok(intent)
    }

    #[must_use]
    pub fn application_name(&self) -> &str {
        match self {
            Self::Create(intent) => &intent.application_name,
            Self::Delete(intent) => &intent.application_name,
        }
    }

    /// Short label used in tracing spans
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Delete(_) => "delete",
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Create(intent) => intent.validate(),
            Self::Delete(intent) => validate_app_name(&intent.application_name),
        }
    }
}

impl DeployIntent {
    /// Check every field before it is interpolated into cluster objects
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_app_name(&self.application_name)?;
        validate_deployment_id(&self.deployment_id)?;
        validate_git_repo(&self.git_repo)
    }
}

/// Application names become namespace names and DNS host labels
pub fn validate_app_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("application name is empty".to_string());
    }
    if name.len() > MAX_APP_NAME_LENGTH {
        return Err(format!(
            "application name '{name}' is longer than {MAX_APP_NAME_LENGTH} characters"
        ));
    }
    if !APP_NAME_RE.is_match(name) {
        return Err(format!(
            "application name '{name}' must consist of lowercase letters, digits and '-', \
             and start and end with a letter or digit"
        ));
    }
    Ok(())
}

pub fn validate_deployment_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() || id.len() > MAX_DEPLOYMENT_ID_LENGTH || !DEPLOYMENT_ID_RE.is_match(id) {
        return Err(format!("deployment id '{id}' is not a valid identifier"));
    }
    Ok(())
}

pub fn validate_git_repo(url: &str) -> std::result::Result<(), String> {
    if !GIT_URL_RE.is_match(url) {
        return Err(format!("git repository '{url}' is not a supported URL"));
    }
    Ok(())
}

/// Message pushed by the build's final stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    /// `"ready"` or `"failed"`; anything but `"ready"` is a failure
    pub status: String,

    #[serde(rename = "app")]
    pub application_name: String,

    /// Unix seconds at which the signal was emitted
    #[serde(default)]
    pub timestamp: i64,

    /// Deployment the signal belongs to (absent in older notifier payloads)
    #[serde(default, rename = "deployment", skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,

    /// Failure detail when `status != "ready"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CompletionSignal {
    pub const READY: &'static str = "ready";

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == Self::READY
    }

    /// Whether the signal can belong to `deployment_id`
    #[must_use]
    pub fn matches_deployment(&self, deployment_id: &str) -> bool {
        self.deployment_id
            .as_deref()
            .map_or(true, |id| id == deployment_id)
    }

    #[must_use]
    pub fn emitted_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}
