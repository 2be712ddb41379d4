//! Resource Sentinel - resource lifecycle and leak management service
//!
//! Runs the sentinel core with in-process collaborators and exposes
//! liveness, readiness and Prometheus endpoints.

use anyhow::Result;
use resource_sentinel::{api, config::ServiceConfig};
use sentinel_lib::Sentinel;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting resource-sentinel");

    let service = ServiceConfig::load()?;
    info!(
        instance = %service.sentinel.instance_name,
        environment = ?service.sentinel.environment,
        api_port = service.api_port,
        "Sentinel configured"
    );

    let sentinel = Sentinel::builder(service.sentinel.clone()).build()?;
    let running = sentinel.start().await?;

    let app_state = Arc::new(api::AppState::new(sentinel.health().clone()));
    let api_handle = tokio::spawn(api::serve(service.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            sentinel.logger().log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => sentinel.logger().log_shutdown("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    running.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
