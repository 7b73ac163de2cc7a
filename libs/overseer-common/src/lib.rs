pub mod config;
pub mod error;
pub mod redis;
pub mod types;

// Re-export commonly used types for convenience
pub use config::WorkerConfig;
pub use error::{Correlation, ErrorRecord, FaultKind, TaskError};
pub use types::{Phase, ResultRecord, TaskEnvelope};
