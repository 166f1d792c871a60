//! Docker Engine API implementation of [`super::SandboxManager`], via
//! `bollard` rather than shelling out to the `docker` CLI.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::time::timeout as tokio_timeout;
use tracing::{info, warn};

use crate::config::PullPolicy;
use crate::error::{WorkerError, WorkerResult};

use super::{ExecOutcome, RunSpec, Sandbox, SandboxManager};

pub struct DockerSandboxManager {
    docker: Docker,
}

impl DockerSandboxManager {
    pub fn connect() -> WorkerResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| WorkerError::DockerCreate(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn image_exists_locally(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }
}

#[async_trait]
impl SandboxManager for DockerSandboxManager {
    async fn prepare(&self, image: &str, policy: PullPolicy, pull_timeout: Duration) -> WorkerResult<()> {
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !self.image_exists_locally(image).await,
            PullPolicy::Never => false,
        };
        if !should_pull {
            return Ok(());
        }

        let options = CreateImageOptions { from_image: image, ..Default::default() };
        let pull = async {
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| WorkerError::DockerPull(e.to_string()))?;
            }
            Ok::<(), WorkerError>(())
        };

        match tokio_timeout(pull_timeout, pull).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if self.image_exists_locally(image).await {
                    warn!(code = "E_DOCKER_PULL", image, error = %e, "pull failed, using local image");
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Err(_) => {
                if self.image_exists_locally(image).await {
                    warn!(code = "E_DOCKER_PULL", image, "pull timed out, using local image");
                    Ok(())
                } else {
                    Err(WorkerError::DockerPull(format!("pull of {image} timed out and no local copy exists")))
                }
            }
        }
    }

    async fn run(&self, spec: RunSpec, run_timeout: Duration) -> WorkerResult<Box<dyn Sandbox>> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut host_config = HostConfig { network_mode: spec.network.clone(), ..Default::default() };
        if spec.map_host_gateway {
            host_config.extra_hosts = Some(vec!["host.docker.internal:host-gateway".to_string()]);
        }

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            cmd: spec.command.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: spec.name.clone(), platform: None };
        let created = tokio_timeout(
            run_timeout,
            self.docker.create_container(Some(options), container_config),
        )
        .await
        .map_err(|_| WorkerError::DockerCreate(format!("create of {} timed out", spec.name)))?
        .map_err(|e| WorkerError::DockerCreate(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| WorkerError::DockerCreate(e.to_string()))?;

        info!(container_id = %created.id, name = %spec.name, "sandbox started");
        Ok(Box::new(DockerSandbox { docker: self.docker.clone(), container_id: created.id }))
    }
}

pub struct DockerSandbox {
    docker: Docker,
    container_id: String,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn wait_ready(&self, poll_interval: Duration, timeout: Duration) -> WorkerResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let inspect = self
                .docker
                .inspect_container(&self.container_id, None)
                .await
                .map_err(|e| WorkerError::DockerWait(e.to_string()))?;
            if inspect.state.and_then(|s| s.running).unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::ContainerStartupTimeout(self.container_id.clone()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn exec(&self, command: &[String], exec_timeout: Duration) -> WorkerResult<ExecOutcome> {
        let exec_options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let run = async {
            let exec = self
                .docker
                .create_exec(&self.container_id, exec_options)
                .await
                .map_err(|e| WorkerError::DockerExecTimeout(e.to_string()))?;

            let mut logs = String::new();
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| WorkerError::DockerExecTimeout(e.to_string()))?
            {
                while let Some(chunk) = output.next().await {
                    if let Ok(chunk) = chunk {
                        logs.push_str(&chunk.to_string());
                    }
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| WorkerError::DockerExecTimeout(e.to_string()))?;
            Ok::<ExecOutcome, WorkerError>(ExecOutcome { exit_code: inspect.exit_code.unwrap_or(-1), logs })
        };

        tokio_timeout(exec_timeout, run)
            .await
            .map_err(|_| WorkerError::DockerExecTimeout(self.container_id.clone()))?
    }

    async fn wait_and_collect_logs(&self, timeout_duration: Duration) -> WorkerResult<ExecOutcome> {
        let wait = async {
            let mut stream = self.docker.wait_container(
                &self.container_id,
                None::<WaitContainerOptions<String>>,
            );
            let mut exit_code = -1;
            while let Some(response) = stream.next().await {
                match response {
                    Ok(r) => exit_code = r.status_code,
                    Err(e) => return Err(WorkerError::DockerWait(e.to_string())),
                }
            }
            Ok(exit_code)
        };

        let exit_code = tokio_timeout(timeout_duration, wait)
            .await
            .map_err(|_| WorkerError::DockerExecTimeout(self.container_id.clone()))??;

        let logs = self.logs().await?;
        Ok(ExecOutcome { exit_code, logs })
    }

    async fn logs(&self) -> WorkerResult<String> {
        let options = LogsOptions::<String> { stdout: true, stderr: true, ..Default::default() };
        let mut stream = self.docker.logs(&self.container_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => out.push_str(&chunk.to_string()),
                Err(e) => return Err(WorkerError::DockerLogs(e.to_string())),
            }
        }
        Ok(out)
    }

    async fn remove(&self) -> WorkerResult<()> {
        let options = RemoveContainerOptions { force: true, ..Default::default() };
        self.docker
            .remove_container(&self.container_id, Some(options))
            .await
            .map_err(|e| WorkerError::DockerCreate(format!("remove failed: {e}")))?;
        Ok(())
    }
}
