/*
 * Launchpad - Kubernetes Deployment Orchestrator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Deployment orchestrator core library
//!
//! Turns queued "deploy this git repository as this app" intents into running,
//! routable workloads, and tears them down again on delete intents.
//!
//! The moving parts, leaf first:
//! - [`provider`]: the cluster capability (`WorkloadProvider`) and its kube implementation
//! - [`broker`]: work queues, completion signals and the per-app log bus (Redis)
//! - [`build`]: build Job construction, log relay and completion wait
//! - [`release`] / [`decommission`]: runtime resource creation and teardown
//! - [`orchestrator`]: the intake loop dispatching supervised pipeline tasks

pub mod broker;
pub mod build;
pub mod config;
pub mod context;
pub mod decommission;
pub mod error;
pub mod intent;
pub mod lease;
pub mod logging;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod release;
pub mod state;
pub mod supervisor;
pub mod wait;

// Re-export commonly used types
pub use broker::{LogBus, QueueError, RedisBroker, WorkQueue};
pub use config::ControllerConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use intent::{CompletionSignal, DeleteIntent, DeployIntent, Intent};
pub use orchestrator::Orchestrator;
pub use provider::{KubeProvider, ProviderError, WorkloadProvider};
