mod broker;
mod engine;
mod executor;
mod harvester;
mod metrics;
mod orchestrator;
mod sandbox;
mod stager;

use anyhow::Context;
use broker::{LogReporter, RedisResultsPublisher, RedisTaskQueue};
use engine::DockerEngine;
use orchestrator::Orchestrator;
use overseer_common::WorkerConfig;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Overseer worker booting...");

    let config = Arc::new(WorkerConfig::from_env());

    metrics::init_metrics().context("Failed to register metrics")?;
    tokio::spawn(metrics::serve(config.metrics_port));

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let conn = ::redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let mut queue = RedisTaskQueue::new(conn, &config);
    queue.recover_in_flight().await?;

    let engine = DockerEngine::connect(&config)?;
    let publisher = RedisResultsPublisher::new(client, config.results_queue.clone());
    let mut orchestrator = Orchestrator::new(
        config.clone(),
        engine,
        Box::new(publisher),
        Box::new(LogReporter),
    );

    info!(
        worker_id = %config.worker_id,
        queue = %queue.queue(),
        sandbox_root = %config.sandbox_root.display(),
        container = %config.container_name,
        "Listening for tasks"
    );

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        // Only the idle wait is interruptible; a task in flight runs to acknowledgment
        let received = tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            received = queue.receive(config.poll_timeout_secs) => received,
        };

        match received {
            Ok(Some(delivery)) => {
                let outcome = orchestrator.process(delivery, &mut queue).await;
                info!(
                    task_id = ?outcome.task_id,
                    succeeded = outcome.succeeded(),
                    build_exit = ?outcome.build_exit.map(|s| s.code),
                    run_exit = ?outcome.run_exit.map(|s| s.code),
                    cleaned_up = outcome.cleaned_up,
                    acknowledged = outcome.acknowledged,
                    published = outcome.published,
                    states = ?outcome.states,
                    "Task finished"
                );
            }
            Ok(None) => continue,
            Err(e) => {
                error!("Redis error: {:#}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// `RUST_LOG` filters; `LOG_FORMAT=json` switches to structured output
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
