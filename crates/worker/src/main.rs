use anyhow::{Context, Result};
use jobguard_worker::{init_telemetry, TelemetryConfig, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine; real deployments set the environment directly
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - LOG_FORMAT=json: structured output
    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("jobguard-worker starting...");

    let config = WorkerConfig::from_env();

    tracing::info!(
        worker_id = %config.worker_id,
        redis = config.redis_url.is_some(),
        postgres = config.database_url.is_some(),
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        lock_ttl_ms = config.job_lock_ttl.as_millis() as u64,
        "Starting worker"
    );

    let mut worker = Worker::build(config)
        .await
        .context("Failed to create worker")?;

    worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    worker.shutdown().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
