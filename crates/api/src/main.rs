mod error;
mod middleware;
mod observability;
mod routes;
mod state;
mod validation;

use std::net::SocketAddr;
use std::time::Duration;

use syllabus_domain::ports::jobs::QueueName;
use syllabus_infra::{config::AppConfig, logging::init_tracing};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let state = state::AppState::new(config.clone()).await?;
    if config.queue_backend == "memory" {
        spawn_inline_worker(&state, Duration::from_millis(config.worker_poll_interval_ms.max(1)));
    }
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting api");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "server exited");
        err
    })?;

    Ok(())
}

/// An in-memory queue is invisible to a separate worker process, so the api
/// consumes it itself.
fn spawn_inline_worker(state: &state::AppState, poll: Duration) {
    let promote_batch = state.config.worker_promote_batch.max(1);
    tracing::warn!("in-memory queue backend: cascades are processed inside the api process");
    let worker = state.runtime.worker();
    for queue in QueueName::ALL {
        let worker = worker.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = worker.run_once(queue, poll).await {
                    tracing::error!(queue = %queue, error = %err, "inline cascade worker step failed");
                    tokio::time::sleep(poll).await;
                }
            }
        });
    }
    let queue = state.runtime.queue.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            if let Err(err) = queue.promote_due(promote_batch).await {
                tracing::warn!(error = %err, "delayed job promotion failed");
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
