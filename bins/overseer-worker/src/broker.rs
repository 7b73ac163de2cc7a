/// Broker-facing interfaces consumed by the orchestrator, with their Redis
/// implementations.
///
/// The orchestrator only sees three narrow seams: acknowledging a delivery,
/// publishing a completion record, and reporting a fault. Queue topology
/// and connection management stay on this side of the seam.

use anyhow::{Context, Result};
use async_trait::async_trait;
use overseer_common::{redis as queue, ErrorRecord, ResultRecord, WorkerConfig};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tracing::{error, info, warn};

/// Opaque acknowledgment handle for one delivery.
///
/// Not `Clone`: acknowledging consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryTag(Vec<u8>);

#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
}

impl Delivery {
    /// A delivery whose tag is the raw payload, as the Redis reliable queue needs.
    /// The bytes are not required to be UTF-8.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self {
            body: payload.clone(),
            tag: DeliveryTag(payload),
        }
    }
}

#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;
}

/// Scoped sequence on the success path: connect, publish once, disconnect.
#[async_trait]
pub trait ResultsPublisher: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn publish(&mut self, record: &ResultRecord) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

/// Fail-fast fault signaling provided by the hosting subscriber
pub trait FaultReporter: Send + Sync {
    fn client_error(&self, body: &[u8], record: &ErrorRecord);
    fn server_error(&self, body: &[u8], record: &ErrorRecord);
}

/// Reliable task queue on a Redis list
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    queue: String,
    processing: String,
}

impl RedisTaskQueue {
    pub fn new(conn: ConnectionManager, config: &WorkerConfig) -> Self {
        Self {
            conn,
            queue: config.task_queue.clone(),
            processing: config.processing_queue(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait up to `timeout_secs` for the next delivery
    pub async fn receive(&mut self, timeout_secs: f64) -> Result<Option<Delivery>> {
        let payload = queue::receive_task(&mut self.conn, &self.queue, &self.processing, timeout_secs)
            .await
            .context("Failed to receive task")?;
        Ok(payload.map(Delivery::from_payload))
    }

    /// Return deliveries left in this worker's processing list by a crash
    pub async fn recover_in_flight(&mut self) -> Result<usize> {
        let moved = queue::requeue_in_flight(&mut self.conn, &self.processing, &self.queue)
            .await
            .context("Failed to requeue in-flight tasks")?;
        if moved > 0 {
            warn!(count = moved, queue = %self.queue, "Requeued in-flight tasks from a previous run");
        }
        Ok(moved)
    }
}

#[async_trait]
impl Acknowledger for RedisTaskQueue {
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let removed = queue::ack_task(&mut self.conn, &self.processing, &tag.0)
            .await
            .context("Failed to acknowledge task")?;
        if removed == 0 {
            warn!("Acknowledged delivery was not in the processing list");
        }
        Ok(())
    }
}

/// Publishes completion records onto a Redis list, one connection per record
pub struct RedisResultsPublisher {
    client: redis::Client,
    queue: String,
    conn: Option<MultiplexedConnection>,
}

impl RedisResultsPublisher {
    pub fn new(client: redis::Client, queue: impl Into<String>) -> Self {
        Self {
            client,
            queue: queue.into(),
            conn: None,
        }
    }
}

#[async_trait]
impl ResultsPublisher for RedisResultsPublisher {
    async fn connect(&mut self) -> Result<()> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect results publisher")?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn publish(&mut self, record: &ResultRecord) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .context("Results publisher is not connected")?;
        queue::push_result(conn, &self.queue, record)
            .await
            .context("Failed to publish result")?;
        info!(task_id = record.task_id, queue = %self.queue, "Published result");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}

/// Faults are logged, never published
pub struct LogReporter;

impl FaultReporter for LogReporter {
    fn client_error(&self, body: &[u8], record: &ErrorRecord) {
        warn!(
            status = record.status,
            task_id = ?record.task_id,
            overseer_assessment_id = ?record.overseer_assessment_id,
            timestamp = ?record.timestamp,
            body = %String::from_utf8_lossy(body),
            "Client error: {}",
            record.message
        );
    }

    fn server_error(&self, body: &[u8], record: &ErrorRecord) {
        error!(
            status = record.status,
            task_id = ?record.task_id,
            overseer_assessment_id = ?record.overseer_assessment_id,
            timestamp = ?record.timestamp,
            body = %String::from_utf8_lossy(body),
            "Server error: {}",
            record.message
        );
    }
}
