//! Local Docker backend.
//!
//! Each environment is a long-lived `sleep infinity` container. Files move
//! in and out as tar archives through the Docker API, and commands run via
//! `docker exec` with per-exec environment variables. Docker has no native
//! inactivity stop, so auto-stop is a background timer per container.

use std::collections::HashMap;
use std::io::Read;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::config::DockerConfig;
use crate::error::SandboxError;
use crate::sandbox::{
    EnvironmentId, ExecOutput, ExecRequest, ProvisionRequest, SandboxBackend, SandboxFile,
    resolve_path,
};

const BACKEND: &str = "docker";

/// Working directory inside every container.
pub const WORKDIR: &str = "/workspace";

pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
    /// Pending auto-stop timers, aborted on destroy.
    auto_stop: Mutex<HashMap<EnvironmentId, AbortHandle>>,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    pub async fn connect(config: DockerConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| SandboxError::Connection {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        })?;
        docker.ping().await.map_err(|e| SandboxError::Connection {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(image = %config.image, "Connected to Docker");

        Ok(Self {
            docker,
            config,
            auto_stop: Mutex::new(HashMap::new()),
        })
    }

    /// Make sure `image` exists locally, pulling it when allowed.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.config.auto_pull_image {
            return Err(SandboxError::ProvisionFailed {
                reason: format!("image {} not found locally and auto-pull is disabled", image),
            });
        }

        tracing::info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::ProvisionFailed {
                reason: format!("failed to pull {}: {}", image, e),
            })?;
        }
        Ok(())
    }

    /// Stop the container after `minutes`, replacing any pending timer.
    async fn arm_auto_stop(&self, id: &EnvironmentId, minutes: u32) {
        let docker = self.docker.clone();
        let container = id.clone();
        let delay = std::time::Duration::from_secs(u64::from(minutes) * 60);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::warn!(environment_id = %container, "Inactivity deadline reached, stopping container");
            if let Err(e) = docker
                .stop_container(container.as_str(), Some(StopContainerOptions { t: 5 }))
                .await
            {
                tracing::warn!(environment_id = %container, error = %e, "Auto-stop failed");
            }
        });

        if let Some(previous) = self
            .auto_stop
            .lock()
            .await
            .insert(id.clone(), task.abort_handle())
        {
            previous.abort();
        }
    }

    async fn cancel_auto_stop(&self, id: &EnvironmentId) {
        if let Some(handle) = self.auto_stop.lock().await.remove(id) {
            handle.abort();
        }
    }
}

/// Pack one file into a tar archive rooted at its parent directory.
fn tar_single_file(name: &str, bytes: &[u8], executable: bool) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(if executable { 0o755 } else { 0o644 });
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, bytes)?;
    builder.into_inner()
}

/// Read the first regular file out of a tar archive.
fn untar_single_file(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "archive contains no regular file",
    ))
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (WORKDIR, path),
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Connection {
                backend: BACKEND.to_string(),
                reason: e.to_string(),
            })
    }

    async fn allocate(&self, request: &ProvisionRequest) -> Result<EnvironmentId, SandboxError> {
        let image = request
            .snapshot
            .clone()
            .unwrap_or_else(|| self.config.image.clone());
        self.ensure_image(&image).await?;

        let host_config = HostConfig {
            memory: Some((self.config.memory_limit_mb * 1024 * 1024) as i64),
            cpu_shares: Some(self.config.cpu_shares as i64),
            network_mode: Some("bridge".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(
                [("/tmp".to_string(), "size=512M".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORKDIR.to_string()),
            labels: Some(request.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::ProvisionFailed {
                reason: format!("failed to create container from {}: {}", image, e),
            })?;
        let id = EnvironmentId::new(response.id);

        if let Some(minutes) = request.auto_stop_minutes {
            self.arm_auto_stop(&id, minutes).await;
        }
        tracing::debug!(environment_id = %id, image = %image, "Created container");
        Ok(id)
    }

    async fn wait_ready(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        self.docker
            .start_container::<String>(id.as_str(), None)
            .await
            .map_err(|e| SandboxError::ProvisionFailed {
                reason: format!("failed to start container {}: {}", id, e),
            })?;

        let running = self
            .docker
            .inspect_container(id.as_str(), None)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(SandboxError::ProvisionFailed {
                reason: format!("container {} exited during startup", id),
            });
        }

        tracing::debug!(environment_id = %id, "Started container");
        Ok(())
    }

    async fn set_auto_stop(&self, id: &EnvironmentId, minutes: u32) -> Result<(), SandboxError> {
        self.arm_auto_stop(id, minutes).await;
        Ok(())
    }

    async fn upload(&self, id: &EnvironmentId, file: &SandboxFile) -> Result<(), SandboxError> {
        let full_path = resolve_path(WORKDIR, &file.path);
        let (dir, name) = split_path(&full_path);
        let upload_failed = |reason: String| SandboxError::UploadFailed {
            id: id.clone(),
            path: full_path.clone(),
            reason,
        };

        let archive = tar_single_file(name, &file.bytes, file.executable)
            .map_err(|e| upload_failed(format!("failed to build archive: {}", e)))?;

        self.docker
            .upload_to_container(
                id.as_str(),
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| upload_failed(e.to_string()))?;

        tracing::debug!(environment_id = %id, path = %full_path, bytes = file.bytes.len(), "Uploaded file");
        Ok(())
    }

    async fn exec(
        &self,
        id: &EnvironmentId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        let exec_failed = |reason: String| SandboxError::ExecFailed {
            id: id.clone(),
            reason,
        };

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value.expose_secret()))
            .collect();

        let options = CreateExecOptions {
            cmd: Some(request.argv.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: Some(
                request
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| WORKDIR.to_string()),
            ),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id.as_str(), options)
            .await
            .map_err(|e| exec_failed(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let collect = async {
            match self.docker.start_exec(&exec.id, None).await {
                Ok(StartExecResults::Attached { mut output, .. }) => {
                    while let Some(chunk) = output.next().await {
                        match chunk.map_err(|e| exec_failed(e.to_string()))? {
                            LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                            _ => {}
                        }
                    }
                    Ok(())
                }
                Ok(StartExecResults::Detached) => {
                    Err(exec_failed("exec started detached".to_string()))
                }
                Err(e) => Err(exec_failed(e.to_string())),
            }
        };

        match request.timeout {
            Some(limit) => tokio::time::timeout(limit, collect)
                .await
                .map_err(|_| exec_failed(format!("command timed out after {:?}", limit)))??,
            None => collect.await?,
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| exec_failed(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn download(&self, id: &EnvironmentId, path: &str) -> Result<Vec<u8>, SandboxError> {
        let full_path = resolve_path(WORKDIR, path);
        let download_failed = |reason: String| SandboxError::DownloadFailed {
            id: id.clone(),
            path: full_path.clone(),
            reason,
        };

        let mut stream = self.docker.download_from_container(
            id.as_str(),
            Some(DownloadFromContainerOptions {
                path: full_path.clone(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_failed(e.to_string()))?;
            archive.extend_from_slice(&chunk);
        }

        untar_single_file(&archive).map_err(|e| download_failed(e.to_string()))
    }

    async fn destroy(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        self.cancel_auto_stop(id).await;
        self.docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::DestroyFailed {
                id: id.clone(),
                reason: e.to_string(),
            })
    }
}
