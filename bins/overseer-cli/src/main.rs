mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "overseer-cli")]
#[command(about = "Overseer CLI - Enqueue assessment tasks and inspect results", long_about = None)]
struct Cli {
    /// Redis URL (defaults to REDIS_URL or redis://127.0.0.1:6379)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a task envelope for the workers
    Submit {
        #[arg(long)]
        task_id: u64,

        #[arg(long)]
        assessment_id: u64,

        /// Container image the phases run in (e.g., overseer/python:3.11)
        #[arg(short, long)]
        image: String,

        /// Submission zip, or a directory with --directory
        #[arg(short, long)]
        submission: PathBuf,

        /// Assessment zip providing build.sh and run.sh
        #[arg(short, long)]
        assessment: PathBuf,

        /// Existing directory that receives the output bundle
        #[arg(short, long)]
        output: PathBuf,

        /// Correlation timestamp (defaults to the current unix time)
        #[arg(long)]
        timestamp: Option<String>,

        /// Submission is a directory rather than a zip archive
        #[arg(long)]
        directory: bool,

        /// Leave the worker's sandbox in place after the task
        #[arg(long)]
        skip_rm: bool,

        /// Task queue (defaults to TASK_QUEUE or overseer:queue:tasks)
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Pop published result records
    Results {
        /// Maximum number of records to pop
        #[arg(short, long, default_value = "10")]
        count: usize,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show queue depths
    Status {
        /// Also show the in-flight list of this worker
        #[arg(short, long)]
        worker_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let redis_url = cli.redis_url.unwrap_or_else(|| {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    });

    match cli.command {
        Commands::Submit {
            task_id,
            assessment_id,
            image,
            submission,
            assessment,
            output,
            timestamp,
            directory,
            skip_rm,
            queue,
        } => {
            let request = commands::SubmitRequest {
                task_id,
                assessment_id,
                image,
                submission,
                assessment,
                output,
                timestamp,
                zip_file: !directory,
                skip_rm,
            };
            commands::submit(&redis_url, queue.as_deref(), request).await?;
        }
        Commands::Results { count, json } => {
            commands::results(&redis_url, count, json).await?;
        }
        Commands::Status { worker_id } => {
            commands::status(&redis_url, worker_id.as_deref()).await?;
        }
    }

    Ok(())
}
