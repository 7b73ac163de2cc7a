use crate::types::{ResultRecord, TaskEnvelope};
use redis::aio::ConnectionLike;
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics - shared by the worker and the CLI so key names
/// never drift.
///
/// Tasks use the reliable-queue pattern: a receive atomically moves the
/// payload from the task list into a per-worker processing list, and the
/// acknowledgment removes it from there. A payload is therefore never lost
/// between receive and ack, even if the worker dies mid-task.

pub const PROCESSING_SUFFIX: &str = "processing";

/// A task payload as stored, not assumed to be UTF-8; decoding belongs to
/// envelope validation so an undecodable body can still be acknowledged
pub type Payload = Option<Vec<u8>>;

/// Per-worker in-flight list for a task queue
pub fn processing_key(task_queue: &str, worker_id: &str) -> String {
    format!("{}:{}:{}", task_queue, PROCESSING_SUFFIX, worker_id)
}

pub async fn push_task<C>(conn: &mut C, queue: &str, envelope: &TaskEnvelope) -> RedisResult<()>
where
    C: ConnectionLike + Send,
{
    let payload = envelope.to_json().map_err(serde_error)?;
    conn.rpush::<_, _, ()>(queue, payload).await
}

/// Block for up to `timeout_secs` waiting for a task; the raw payload is
/// returned untouched so validation stays with the orchestrator.
pub async fn receive_task<C>(
    conn: &mut C,
    queue: &str,
    processing: &str,
    timeout_secs: f64,
) -> RedisResult<Payload>
where
    C: ConnectionLike + Send,
{
    redis::cmd("BLMOVE")
        .arg(queue)
        .arg(processing)
        .arg("LEFT")
        .arg("RIGHT")
        .arg(timeout_secs)
        .query_async(conn)
        .await
}

/// Remove one delivered payload from the processing list
pub async fn ack_task<C>(conn: &mut C, processing: &str, payload: &[u8]) -> RedisResult<i64>
where
    C: ConnectionLike + Send,
{
    conn.lrem(processing, 1, payload).await
}

/// Move payloads stranded by a previous crash back onto the task queue
pub async fn requeue_in_flight<C>(conn: &mut C, processing: &str, queue: &str) -> RedisResult<usize>
where
    C: ConnectionLike + Send,
{
    let mut moved = 0;
    loop {
        let payload: Payload = redis::cmd("LMOVE")
            .arg(processing)
            .arg(queue)
            .arg("LEFT")
            .arg("LEFT")
            .query_async(conn)
            .await?;
        if payload.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

pub async fn push_result<C>(conn: &mut C, queue: &str, record: &ResultRecord) -> RedisResult<()>
where
    C: ConnectionLike + Send,
{
    let payload = serde_json::to_string(record).map_err(serde_error)?;
    conn.rpush::<_, _, ()>(queue, payload).await
}

/// Pop up to `count` result records, oldest first
pub async fn pop_results<C>(conn: &mut C, queue: &str, count: usize) -> RedisResult<Vec<ResultRecord>>
where
    C: ConnectionLike + Send,
{
    let mut records = Vec::new();
    for _ in 0..count {
        let payload: Option<String> = conn.lpop(queue, None).await?;
        let Some(payload) = payload else { break };
        records.push(serde_json::from_str(&payload).map_err(serde_error)?);
    }
    Ok(records)
}

pub async fn queue_depth<C>(conn: &mut C, queue: &str) -> RedisResult<usize>
where
    C: ConnectionLike + Send,
{
    conn.llen(queue).await
}

fn serde_error(err: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "payload serialization failed",
        err.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{FromRedisValue, Value};

    #[test]
    fn test_payload_keeps_non_utf8_bytes() {
        let raw = vec![0xff, 0xfe, b'{', b'}'];
        let payload = Payload::from_redis_value(&Value::Data(raw.clone())).unwrap();
        assert_eq!(payload, Some(raw));
    }

    #[test]
    fn test_empty_list_is_no_payload() {
        assert_eq!(Payload::from_redis_value(&Value::Nil).unwrap(), None);
    }

    #[test]
    fn test_processing_key_format() {
        assert_eq!(
            processing_key("overseer:queue:tasks", "w1"),
            "overseer:queue:tasks:processing:w1"
        );
    }

    #[test]
    fn test_processing_key_deterministic() {
        let a = processing_key("q", "worker");
        let b = processing_key("q", "worker");
        assert_eq!(a, b);
        assert!(a.starts_with("q:processing:"));
    }
}
