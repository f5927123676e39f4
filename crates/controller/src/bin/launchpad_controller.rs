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

//! Launchpad controller service
//!
//! Consumes deploy and delete intents from the broker and drives them against
//! the cluster:
//! - builds the app's repository with a buildpacks Job and relays its logs
//! - releases the image as a workload, service and route
//! - tears apps down, forced or draining first
//! - serves health and readiness endpoints

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use launchpad_controller::logging::{init_logging, shutdown_signal, LogFormat};
use launchpad_controller::{Context, ControllerConfig, KubeProvider, Orchestrator, RedisBroker};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "launchpad-controller", version, about)]
struct Args {
    /// Mounted YAML configuration
    #[arg(long, env = "CONTROLLER_CONFIG_PATH", default_value = "/config/config.yaml")]
    config: String,

    /// Broker URL (overrides broker.url)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Registry builds are pushed to (overrides build.registry)
    #[arg(long, env = "REGISTRY_URL")]
    registry_url: Option<String>,

    /// Registry address as seen by cluster nodes (overrides release.pullHost)
    #[arg(long, env = "REGISTRY_PULL_HOST")]
    registry_pull_host: Option<String>,

    /// Apps are exposed as `{app}.{domain}` (overrides release.domain)
    #[arg(long, env = "APP_DOMAIN")]
    app_domain: Option<String>,

    /// Health endpoint address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone)]
struct AppState {
    broker: RedisBroker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    info!(
        "Starting Launchpad Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = load_controller_config(&args.config);
    apply_overrides(&mut config, &args);
    config.validate().context("invalid controller configuration")?;
    let config = Arc::new(config);

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let provider = Arc::new(KubeProvider::new(
        client,
        config.timeouts.provider_call(),
        &config.release.route,
    ));

    let mut backoff = config.intake.reconnect_backoff();
    let broker = RedisBroker::connect_with_backoff(&config.broker.url, &mut backoff).await;
    info!("Connected to broker");

    let broker_handle = Arc::new(broker.clone());
    let ctx = Context::new(provider, broker_handle.clone(), broker_handle, config.clone());

    let shutdown = CancellationToken::new();
    let orchestrator_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            Orchestrator::new(ctx).run(shutdown).await;
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(10),
                )),
        )
        .with_state(AppState { broker });

    let listener = tokio::net::TcpListener::bind(&args.health_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.health_addr))?;
    info!("Controller HTTP server listening on {}", args.health_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // The orchestrator drains in-flight pipelines before returning
    if let Err(e) = orchestrator_handle.await {
        error!("Orchestrator task ended abnormally: {}", e);
    }
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "launchpad-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.broker.ping().await {
        Ok(()) => Ok(Json(json!({
            "status": "ready",
            "service": "launchpad-controller",
            "version": env!("CARGO_PKG_VERSION")
        }))),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn load_controller_config(config_path: &str) -> ControllerConfig {
    if !Path::new(config_path).exists() {
        info!("No configuration file at {}, using defaults", config_path);
        return ControllerConfig::default();
    }

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

fn apply_overrides(config: &mut ControllerConfig, args: &Args) {
    if let Some(url) = &args.redis_url {
        config.broker.url.clone_from(url);
    }
    if let Some(registry) = &args.registry_url {
        config.build.registry.clone_from(registry);
    }
    if let Some(pull_host) = &args.registry_pull_host {
        config.release.pull_host = Some(pull_host.clone());
    }
    if let Some(domain) = &args.app_domain {
        config.release.domain.clone_from(domain);
    }
}
