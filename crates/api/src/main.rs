use anyhow::Context;

use troubadour_api::app::{self, services};
use troubadour_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    troubadour_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let wiring = services::build_services(&config).await?;

    // Recovery runs inside the worker before its first poll.
    let worker = wiring.worker.spawn();
    let router = app::build_app(wiring.services.with_trigger(worker.trigger()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    if tokio::time::timeout(services::SHUTDOWN_GRACE, worker.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("worker did not stop within the grace period");
    }
    Ok(())
}
