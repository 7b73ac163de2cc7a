// CLI commands for operating Overseer queues
use anyhow::{Context, Result};
use overseer_common::redis as queue;
use overseer_common::{TaskEnvelope, WorkerConfig};
use redis::aio::MultiplexedConnection;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Arguments of `overseer-cli submit`
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_id: u64,
    pub assessment_id: u64,
    pub image: String,
    pub submission: PathBuf,
    pub assessment: PathBuf,
    pub output: PathBuf,
    pub timestamp: Option<String>,
    pub zip_file: bool,
    pub skip_rm: bool,
}

/// Build the envelope and run it through the worker's own validation
pub fn build_envelope(request: SubmitRequest) -> Result<TaskEnvelope> {
    let timestamp = match request.timestamp {
        Some(ts) => ts,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock before unix epoch")?
            .as_secs()
            .to_string(),
    };

    let envelope = TaskEnvelope {
        task_id: request.task_id,
        overseer_assessment_id: request.assessment_id,
        docker_image_name_tag: request.image,
        submission: request.submission,
        assessment: request.assessment,
        output_path: request.output,
        timestamp,
        zip_file: request.zip_file,
        skip_rm: request.skip_rm,
    };

    let json = envelope.to_json().context("Failed to serialize envelope")?;
    TaskEnvelope::parse(json.as_bytes()).map_err(|e| anyhow::anyhow!("{}", e.message()))
}

async fn connect(redis_url: &str) -> Result<MultiplexedConnection> {
    let client = redis::Client::open(redis_url)?;
    client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Push a task envelope onto the task queue
pub async fn submit(redis_url: &str, queue_name: Option<&str>, request: SubmitRequest) -> Result<()> {
    let envelope = build_envelope(request)?;
    let config = WorkerConfig::from_env();
    let queue_name = queue_name.unwrap_or(&config.task_queue);

    if !envelope.output_path.is_dir() {
        println!(
            "⚠️  Output path {} does not exist here; the worker will reject the task unless it exists on the worker host",
            envelope.output_path.display()
        );
    }

    let mut conn = connect(redis_url).await?;
    queue::push_task(&mut conn, queue_name, &envelope)
        .await
        .context("Failed to enqueue task")?;

    println!("✅ Task {} enqueued on {}", envelope.task_id, queue_name);
    println!("   Assessment: {}", envelope.overseer_assessment_id);
    println!("   Image:      {}", envelope.docker_image_name_tag);
    println!("   Output:     {}", envelope.output_path.display());
    Ok(())
}

/// Pop up to `count` result records, oldest first
pub async fn results(redis_url: &str, count: usize, json: bool) -> Result<()> {
    let config = WorkerConfig::from_env();
    let mut conn = connect(redis_url).await?;
    let records = queue::pop_results(&mut conn, &config.results_queue, count)
        .await
        .context("Failed to read results")?;

    if records.is_empty() {
        if !json {
            println!("No results on {}", config.results_queue);
        }
        return Ok(());
    }

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!(
                "📦 task {} (assessment {}) at {} → {}",
                record.task_id, record.overseer_assessment_id, record.timestamp, record.output_path
            );
        }
    }
    Ok(())
}

/// Print task, result and optional in-flight queue depths
pub async fn status(redis_url: &str, worker_id: Option<&str>) -> Result<()> {
    let config = WorkerConfig::from_env();
    let mut conn = connect(redis_url).await?;

    let tasks = queue::queue_depth(&mut conn, &config.task_queue).await?;
    let results = queue::queue_depth(&mut conn, &config.results_queue).await?;

    println!("📋 Queue status");
    println!("  {:<40} {}", config.task_queue, tasks);
    println!("  {:<40} {}", config.results_queue, results);

    if let Some(worker_id) = worker_id {
        let processing = queue::processing_key(&config.task_queue, worker_id);
        let in_flight = queue::queue_depth(&mut conn, &processing).await?;
        println!("  {:<40} {}", processing, in_flight);
    }
    Ok(())
}
