use crate::error::TaskError;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// Pipeline phase
/// Each phase is exactly one container invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Build,
    Run,
}

impl Phase {
    /// Script the assessment bundle must provide for this phase
    pub fn script(&self) -> &'static str {
        match self {
            Phase::Build => "build.sh",
            Phase::Run => "run.sh",
        }
    }

    /// Per-phase diff artifact name under output_path
    pub fn diff_file(&self) -> String {
        format!("{}-diff.txt", self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Build => write!(f, "build"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Task Envelope (Immutable)
/// Parsed from the inbound queue message, owned by the orchestrator
/// for the duration of one delivery.
///
/// ## Flags
/// - `zip_file`: submission is a zip archive to flatten-extract;
///   otherwise it is a directory copied wholesale
/// - `skip_rm`: leave the sandbox in place after the task (debugging)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEnvelope {
    pub task_id: u64,
    pub overseer_assessment_id: u64,
    pub docker_image_name_tag: String,
    pub submission: PathBuf,
    pub assessment: PathBuf,
    pub output_path: PathBuf,
    pub timestamp: String,
    #[serde(serialize_with = "serialize_flag")]
    pub zip_file: bool,
    #[serde(serialize_with = "serialize_flag")]
    pub skip_rm: bool,
}

fn serialize_flag<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*flag))
}

impl TaskEnvelope {
    /// Parse and validate a raw message body.
    ///
    /// Every failure is a ClientFault with status 400 and happens before
    /// anything touches the filesystem.
    pub fn parse(body: &[u8]) -> Result<Self, TaskError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| TaskError::client(format!("Malformed task message: {}", e)))?;
        let fields = value
            .as_object()
            .ok_or_else(|| TaskError::client("Task message must be a JSON object"))?;

        Ok(Self {
            task_id: positive_integer(fields, "task_id")?,
            overseer_assessment_id: positive_integer(fields, "overseer_assessment_id")?,
            docker_image_name_tag: non_empty_string(fields, "docker_image_name_tag")?,
            submission: PathBuf::from(non_empty_string(fields, "submission")?),
            assessment: PathBuf::from(non_empty_string(fields, "assessment")?),
            output_path: PathBuf::from(non_empty_string(fields, "output_path")?),
            timestamp: string(fields, "timestamp")?,
            zip_file: flag(fields, "zip_file")?,
            skip_rm: flag(fields, "skip_rm")?,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Re-root the three path fields under a development prefix.
    pub fn with_path_prefix(mut self, prefix: &Path) -> Self {
        self.submission = prefixed(prefix, &self.submission);
        self.assessment = prefixed(prefix, &self.assessment);
        self.output_path = prefixed(prefix, &self.output_path);
        self
    }

    /// Completion record published on the success path
    pub fn result_record(&self) -> ResultRecord {
        ResultRecord {
            overseer_assessment_id: self.overseer_assessment_id,
            task_id: self.task_id,
            timestamp: self.timestamp.clone(),
            output_path: self.output_path.display().to_string(),
        }
    }
}

fn prefixed(prefix: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    prefix.join(relative)
}

fn positive_integer(fields: &Map<String, Value>, key: &str) -> Result<u64, TaskError> {
    match fields.get(key) {
        None | Some(Value::Null) => Err(TaskError::client(format!("Missing {}", key))),
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Ok(n),
            _ => Err(TaskError::client(format!("Invalid {}: {}", key, v))),
        },
    }
}

fn string(fields: &Map<String, Value>, key: &str) -> Result<String, TaskError> {
    match fields.get(key) {
        None | Some(Value::Null) => Err(TaskError::client(format!("Missing {}", key))),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(v) => Err(TaskError::client(format!("Invalid {}: {}", key, v))),
    }
}

fn non_empty_string(fields: &Map<String, Value>, key: &str) -> Result<String, TaskError> {
    let s = string(fields, key)?;
    if s.trim().is_empty() {
        return Err(TaskError::client(format!("Empty {}", key)));
    }
    Ok(s)
}

/// Flags arrive as 1, "1" or true depending on the producer.
fn flag(fields: &Map<String, Value>, key: &str) -> Result<bool, TaskError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_i64() == Some(1)),
        Some(Value::String(s)) => Ok(s.trim() == "1"),
        Some(v) => Err(TaskError::client(format!("Invalid {}: {}", key, v))),
    }
}

/// Completion record
/// Written by the worker after a successful pipeline, read by the results consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub overseer_assessment_id: u64,
    pub task_id: u64,
    pub timestamp: String,
    pub output_path: String,
}
