/// Phase Executor - one container invocation per phase
///
/// **Responsibility:**
/// Turn a phase into a `ContainerSpec`, drive the engine through
/// remove → run → wait → diff → remove, and hand back the raw exit status
/// plus the filesystem diff. Whether the status is good or bad is the
/// orchestrator's call.

use crate::engine::{ContainerEngine, ContainerSpec, ExitStatus, Mount, ResourceLimits};
use crate::sandbox::SandboxPaths;
use overseer_common::{Phase, TaskError, WorkerConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

/// Outcome of one phase, folded into the output bundle by the harvester
#[derive(Debug, Clone)]
pub struct PhaseRun {
    pub phase: Phase,
    /// Random prefix of this phase's log and document files
    pub token: String,
    pub exit: ExitStatus,
    pub diff: String,
    pub duration: Duration,
}

impl PhaseRun {
    pub fn log_file(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(format!("{}.txt", self.token))
    }

    pub fn document_file(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(format!("{}.yaml", self.token))
    }
}

/// Build the container spec for a phase.
///
/// The in-container command makes the phase script executable and runs it
/// with both output streams redirected into `<token>.txt`; the script may
/// write its structured result to the path given as its first argument
/// (also exported as `OUTPUT_YAML`).
pub fn phase_spec(
    config: &WorkerConfig,
    sandbox: &SandboxPaths,
    phase: Phase,
    image: &str,
    token: &str,
) -> ContainerSpec {
    let output_dir = config.container_output_dir.trim_end_matches('/');
    let log = format!("{}/{}.txt", output_dir, token);
    let document = format!("{}/{}.yaml", output_dir, token);
    let script = phase.script();

    ContainerSpec {
        name: sandbox.container_name.clone(),
        image: image.to_string(),
        mounts: vec![
            Mount {
                host: sandbox.exec_dir.clone(),
                container: config.container_workdir.clone(),
            },
            Mount {
                host: sandbox.out_dir.clone(),
                container: config.container_output_dir.clone(),
            },
        ],
        working_dir: config.container_workdir.clone(),
        command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "chmod +x ./{script} && ./{script} \"$OUTPUT_YAML\" > \"$OUTPUT_LOG\" 2>&1",
                script = script
            ),
        ],
        env: vec![
            ("OUTPUT_YAML".to_string(), document),
            ("OUTPUT_LOG".to_string(), log),
            ("PHASE".to_string(), phase.to_string()),
        ],
        limits: ResourceLimits::from_config(config),
        timeout: Duration::from_secs(config.container_timeout_secs),
    }
}

/// Run one phase in a fresh container.
pub async fn run_phase<E>(
    engine: &E,
    config: &WorkerConfig,
    sandbox: &SandboxPaths,
    phase: Phase,
    image: &str,
) -> Result<PhaseRun, TaskError>
where
    E: ContainerEngine + ?Sized,
{
    if image.trim().is_empty() {
        return Err(TaskError::client("Missing docker_image_name_tag"));
    }

    let script = sandbox.exec_dir.join(phase.script());
    if !script.is_file() {
        return Err(TaskError::server(format!(
            "File {} doesn't exist",
            script.display()
        )));
    }

    let token = Uuid::new_v4().simple().to_string();
    let spec = phase_spec(config, sandbox, phase, image, &token);

    info!(phase = %phase, image = %image, token = %token, "Starting phase");
    let started = Instant::now();

    engine.remove_container(&spec.name).await.map_err(unclassified)?;
    let handle = engine.run_container(&spec).await.map_err(unclassified)?;
    let exit = engine.wait(&handle, spec.timeout).await.map_err(unclassified)?;
    let diff = engine.diff(&spec.name).await.map_err(unclassified)?;
    engine.remove_container(&spec.name).await.map_err(unclassified)?;

    let duration = started.elapsed();
    info!(
        phase = %phase,
        exit_code = exit.code,
        timed_out = exit.timed_out,
        duration_ms = duration.as_millis() as u64,
        "Phase finished"
    );

    Ok(PhaseRun {
        phase,
        token,
        exit,
        diff,
        duration,
    })
}

fn unclassified(err: anyhow::Error) -> TaskError {
    TaskError::server(format!("{:#}", err))
}
