/// Container Engine - Abstraction over the container runtime
///
/// **Core Responsibility:**
/// Start one container from a typed spec, wait for it under a wall-clock
/// ceiling, report what it changed on its filesystem, and remove it.
///
/// **Architectural Boundary:**
/// - Engine knows HOW to run a container (Docker today)
/// - Engine does NOT interpret exit statuses; gating belongs to the orchestrator
/// - Engine never sees shell strings built on the host; `ContainerSpec` is structured data

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use overseer_common::WorkerConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit status reported when the wall-clock ceiling kills a container,
/// matching coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
}

impl Mount {
    fn bind(&self) -> String {
        format!("{}:{}:rw", self.host.display(), self.container)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpus: f64,
    pub network_disabled: bool,
}

impl ResourceLimits {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            memory_bytes: (config.container_memory_mb as i64) * 1024 * 1024,
            cpus: config.container_cpus,
            network_disabled: true,
        }
    }

    fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// Everything needed to start one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub working_dir: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
    pub timed_out: bool,
}

impl ExitStatus {
    pub fn exited(code: i64) -> Self {
        Self {
            code,
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            code: TIMEOUT_EXIT_CODE,
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0 && !self.timed_out
    }
}

/// Container engine trait
///
/// Any implementation must guarantee:
/// 1. `remove_container` is idempotent; a missing container is not an error
/// 2. `wait` enforces the timeout and kills the container when it expires
/// 3. `diff` is callable after the container has exited
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn wait(&self, handle: &ContainerHandle, timeout: Duration) -> Result<ExitStatus>;

    async fn diff(&self, name: &str) -> Result<String>;
}

/// Docker-based engine
///
/// **Docker Execution Rules:**
/// 1. Pulls the image if not present (with registry credentials when configured)
/// 2. Creates the container with network disabled and CPU/memory caps
/// 3. Bind-mounts the sandbox exec and output dirs read/write
/// 4. Kills the container when the wall-clock ceiling expires
pub struct DockerEngine {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerEngine {
    pub fn connect(config: &WorkerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        let credentials = match (&config.registry_user, &config.registry_token) {
            (Some(user), Some(token)) => Some(DockerCredentials {
                username: Some(user.clone()),
                password: Some(token.clone()),
                serveraddress: config.registry_url.clone(),
                ..Default::default()
            }),
            _ => None,
        };

        Ok(Self {
            docker,
            credentials,
        })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self
            .docker
            .create_image(options, None, self.credentials.clone());
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull image {}", image))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(name, options).await {
            Ok(()) => {
                debug!(container = %name, "Removed container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", name)),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(Mount::bind).collect()),
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_bytes),
            nano_cpus: Some(spec.limits.nano_cpus()),
            network_mode: spec.limits.network_disabled.then(|| "none".to_string()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(spec.limits.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("Failed to create container")?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        info!(container = %spec.name, image = %spec.image, "Started container");

        Ok(ContainerHandle {
            id: container.id,
            name: spec.name.clone(),
        })
    }

    async fn wait(&self, handle: &ContainerHandle, timeout: Duration) -> Result<ExitStatus> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut stream = self.docker.wait_container(&handle.id, options);

        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(response))) => Ok(ExitStatus::exited(response.status_code)),
            // bollard surfaces non-zero exits as an error carrying the code
            Ok(Some(Err(DockerError::DockerContainerWaitError { code, .. }))) => {
                Ok(ExitStatus::exited(code))
            }
            Ok(Some(Err(e))) => Err(e).context("Failed waiting for container"),
            Ok(None) => anyhow::bail!("Wait stream for {} ended without a status", handle.name),
            Err(_) => {
                warn!(
                    container = %handle.name,
                    timeout_secs = timeout.as_secs(),
                    "Container exceeded wall-clock ceiling, killing"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&handle.id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container = %handle.name, error = %e, "Failed to kill container");
                }
                Ok(ExitStatus::timeout())
            }
        }
    }

    async fn diff(&self, name: &str) -> Result<String> {
        let changes = self
            .docker
            .container_changes(name)
            .await
            .with_context(|| format!("Failed to diff container {}", name))?
            .unwrap_or_default();

        let lines: Vec<String> = changes
            .iter()
            .map(|change| format!("{} {}", change_marker(change.kind as i64), change.path))
            .collect();
        Ok(lines.join("\n"))
    }
}

/// `docker diff` markers for the engine's numeric change kinds
fn change_marker(kind: i64) -> char {
    match kind {
        0 => 'C',
        1 => 'A',
        2 => 'D',
        _ => '?',
    }
}
