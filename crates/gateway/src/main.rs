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

//! Launchpad gateway
//!
//! Public entry point of the platform: accepts deploy and delete requests,
//! queues them for the controller, and streams an app's progress lines over a
//! websocket.

mod routes;

use anyhow::Context as _;
use clap::Parser;
use launchpad_controller::config::BrokerConfig;
use launchpad_controller::logging::{init_logging, shutdown_signal, LogFormat};
use launchpad_controller::wait::Backoff;
use launchpad_controller::RedisBroker;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use routes::{router, AppState};

#[derive(Parser, Debug)]
#[command(name = "launchpad-gateway", version, about)]
struct Args {
    /// Listen address
    #[arg(long, env = "GATEWAY_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[arg(long, env = "CREATE_QUEUE", default_value = "create_queue")]
    create_queue: String,

    #[arg(long, env = "DELETE_QUEUE", default_value = "delete_queue")]
    delete_queue: String,

    #[arg(long, env = "LOG_CHANNEL_PREFIX", default_value = "logs:")]
    log_channel_prefix: String,

    /// Bound on non-streaming requests
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    info!("Starting Launchpad Gateway v{}", env!("CARGO_PKG_VERSION"));

    let broker_config = BrokerConfig {
        url: args.redis_url.clone(),
        create_queue: args.create_queue.clone(),
        delete_queue: args.delete_queue.clone(),
        log_channel_prefix: args.log_channel_prefix.clone(),
        ..BrokerConfig::default()
    };

    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
    let broker = Arc::new(RedisBroker::connect_with_backoff(&broker_config.url, &mut backoff).await);
    info!("Connected to broker");

    let state = AppState {
        queue: broker.clone(),
        logs: broker,
        broker: Arc::new(broker_config),
    };

    // Websocket streams are long-lived, so the request timeout only wraps
    // the other routes (see `routes::router`)
    let app = router(state, Duration::from_secs(args.request_timeout_secs)).layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    info!("Gateway listening on {}", args.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}
