/// Task Orchestrator - drives one delivery from validation to acknowledgment
///
/// **State machine:**
/// Validating → Staging → Building → (Running | SkippedRun) → Finalizing
/// → CleaningUp → Acknowledged
///
/// **Contract:**
/// - Run executes only when the build exited with status zero
/// - Any fault after validation aborts the remaining phases but still
///   reaches CleaningUp (unless `skip_rm`) and Acknowledged
/// - An envelope that fails validation is acknowledged without cleanup;
///   nothing was staged for it
/// - The delivery is acknowledged exactly once on every path
/// - Only a faultless task whose run phase executed is published; faults
///   go to the `FaultReporter`
///
/// The orchestrator is the only writer of the sandbox and the fixed
/// container name, and processes one delivery at a time.

use crate::broker::{Acknowledger, Delivery, FaultReporter, ResultsPublisher};
use crate::engine::{ContainerEngine, ExitStatus};
use crate::executor::{self, PhaseRun};
use crate::harvester;
use crate::metrics;
use crate::sandbox::SandboxPaths;
use crate::stager;
use overseer_common::{Correlation, ErrorRecord, FaultKind, Phase, ResultRecord, TaskEnvelope, TaskError, WorkerConfig};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Validating,
    Staging,
    Building,
    Running,
    SkippedRun,
    Finalizing,
    CleaningUp,
    Acknowledged,
}

/// What happened to one delivery
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub task_id: Option<u64>,
    /// States entered, in order
    pub states: Vec<PipelineState>,
    pub build_exit: Option<ExitStatus>,
    pub run_exit: Option<ExitStatus>,
    pub cleaned_up: bool,
    pub acknowledged: bool,
    pub published: bool,
    pub fault: Option<TaskError>,
}

impl TaskOutcome {
    fn enter(&mut self, state: PipelineState) {
        debug!(task_id = ?self.task_id, state = ?state, "Entering state");
        self.states.push(state);
    }

    /// Overall success: no fault and the build gate let the run phase execute
    pub fn succeeded(&self) -> bool {
        self.fault.is_none() && self.run_exit.is_some()
    }

    fn label(&self) -> String {
        match &self.fault {
            Some(fault) => fault.kind().to_string(),
            None if self.run_exit.is_some() => "success".to_string(),
            None => "build_failed".to_string(),
        }
    }
}

pub struct Orchestrator<E: ContainerEngine> {
    config: Arc<WorkerConfig>,
    sandbox: SandboxPaths,
    engine: E,
    publisher: Box<dyn ResultsPublisher>,
    reporter: Box<dyn FaultReporter>,
}

impl<E: ContainerEngine> Orchestrator<E> {
    pub fn new(
        config: Arc<WorkerConfig>,
        engine: E,
        publisher: Box<dyn ResultsPublisher>,
        reporter: Box<dyn FaultReporter>,
    ) -> Self {
        Self {
            sandbox: SandboxPaths::from_config(&config),
            config,
            engine,
            publisher,
            reporter,
        }
    }

    /// Process one delivery to its terminal state.
    ///
    /// Never returns an error: every failure is classified, reported and
    /// acknowledged here.
    pub async fn process(&mut self, delivery: Delivery, acker: &mut dyn Acknowledger) -> TaskOutcome {
        metrics::record_task_received();
        let Delivery { tag, body } = delivery;
        let mut outcome = TaskOutcome::default();

        outcome.enter(PipelineState::Validating);
        let envelope = match self.validate(&body) {
            Ok(envelope) => Some(envelope),
            Err(fault) => {
                outcome.fault = Some(fault);
                None
            }
        };

        if let Some(envelope) = &envelope {
            outcome.task_id = Some(envelope.task_id);
            info!(
                task_id = envelope.task_id,
                overseer_assessment_id = envelope.overseer_assessment_id,
                image = %envelope.docker_image_name_tag,
                "Processing task"
            );

            if let Err(fault) = self.execute(envelope, &mut outcome).await {
                outcome.fault = Some(fault);
            }
            outcome.enter(PipelineState::Finalizing);

            if envelope.skip_rm {
                info!(task_id = envelope.task_id, "skip_rm set, leaving sandbox in place");
            } else {
                outcome.enter(PipelineState::CleaningUp);
                match self.cleanup().await {
                    Ok(()) => outcome.cleaned_up = true,
                    Err(e) => error!(task_id = envelope.task_id, "Cleanup failed: {}", e),
                }
            }
        } else {
            outcome.enter(PipelineState::Finalizing);
        }

        match acker.ack(tag).await {
            Ok(()) => outcome.acknowledged = true,
            Err(e) => error!(task_id = ?outcome.task_id, "Acknowledgment failed: {:#}", e),
        }
        outcome.enter(PipelineState::Acknowledged);

        match (&outcome.fault, &envelope) {
            (Some(fault), _) => self.report(&body, fault),
            (None, Some(envelope)) if outcome.run_exit.is_some() => {
                outcome.published = self.publish(&envelope.result_record()).await;
            }
            (None, Some(envelope)) => info!(
                task_id = envelope.task_id,
                "Build did not succeed, no result published"
            ),
            (None, None) => {}
        }

        metrics::record_task_completed(&outcome.label());
        outcome
    }

    fn validate(&self, body: &[u8]) -> Result<TaskEnvelope, TaskError> {
        let envelope = TaskEnvelope::parse(body)?;
        Ok(match &self.config.dev_path_prefix {
            Some(prefix) => envelope.with_path_prefix(prefix),
            None => envelope,
        })
    }

    async fn execute(&self, envelope: &TaskEnvelope, outcome: &mut TaskOutcome) -> Result<(), TaskError> {
        outcome.enter(PipelineState::Staging);
        stager::preflight(envelope)?;
        self.sandbox.reset()?;
        harvester::reset_bundle(&envelope.output_path)?;
        let (staged, sandbox) = (envelope.clone(), self.sandbox.clone());
        blocking(move || stager::stage(&staged, &sandbox)).await?;

        outcome.enter(PipelineState::Building);
        let build = self.phase(envelope, Phase::Build).await?;
        outcome.build_exit = Some(build.exit);

        if build.exit.success() {
            outcome.enter(PipelineState::Running);
            let run = self.phase(envelope, Phase::Run).await?;
            outcome.run_exit = Some(run.exit);
        } else {
            outcome.enter(PipelineState::SkippedRun);
            info!(
                task_id = envelope.task_id,
                exit_code = build.exit.code,
                timed_out = build.exit.timed_out,
                "Build failed, skipping run phase"
            );
        }
        Ok(())
    }

    async fn phase(&self, envelope: &TaskEnvelope, phase: Phase) -> Result<PhaseRun, TaskError> {
        let run = executor::run_phase(
            &self.engine,
            &self.config,
            &self.sandbox,
            phase,
            &envelope.docker_image_name_tag,
        )
        .await?;
        metrics::record_phase(phase, run.exit, run.duration.as_secs_f64());

        let (harvested, out_dir, output_path) = (
            run.clone(),
            self.sandbox.out_dir.clone(),
            envelope.output_path.clone(),
        );
        blocking(move || harvester::harvest(&harvested, &out_dir, &output_path)).await?;
        Ok(run)
    }

    /// Tear down the sandbox and the fixed-name container; both are attempted
    async fn cleanup(&self) -> Result<(), TaskError> {
        let sandbox = self.sandbox.clone();
        let teardown = blocking(move || sandbox.teardown().map_err(TaskError::from)).await;
        let removal = self
            .engine
            .remove_container(&self.sandbox.container_name)
            .await
            .map_err(|e| TaskError::server(format!("{:#}", e)));
        teardown.and(removal)
    }

    async fn publish(&mut self, record: &ResultRecord) -> bool {
        let published = match self.publisher.connect().await {
            Ok(()) => {
                let result = self.publisher.publish(record).await;
                if let Err(e) = self.publisher.disconnect().await {
                    warn!(task_id = record.task_id, "Results publisher disconnect failed: {:#}", e);
                }
                result
            }
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                metrics::record_result_published();
                true
            }
            Err(e) => {
                error!(task_id = record.task_id, "Failed to publish result: {:#}", e);
                false
            }
        }
    }

    fn report(&self, body: &[u8], fault: &TaskError) {
        let record = ErrorRecord::new(fault, &Correlation::from_body(body));
        match fault.kind() {
            FaultKind::ClientFault => self.reporter.client_error(body, &record),
            FaultKind::ServerFault => self.reporter.server_error(body, &record),
        }
    }
}

/// Run synchronous filesystem work off the async thread; a panic there is a server fault
async fn blocking<T, F>(work: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TaskError::server(format!("Blocking task failed: {}", e)))?
}
