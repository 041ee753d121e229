use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use tracing::debug;

use crate::config::{ContainerSection, ExecSection};
use crate::errors::RuntimeError;

/// Label carrying the owning project on every container we create.
pub const PROJECT_LABEL: &str = "runway.project";

/// Everything needed to create a project container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub project: String,
    pub image: String,
    /// Host directory bound read-write at `workdir`.
    pub source: PathBuf,
    pub workdir: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    /// Long-running placeholder that keeps the container alive.
    pub keepalive: Vec<String>,
}

/// A command to run inside an existing container.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub tty: bool,
    pub interactive: bool,
    /// Wall-clock limit enforced inside the container, if supported.
    pub deadline: Option<Duration>,
}

impl ExecSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>, workdir: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            workdir: workdir.into(),
            ..Self::default()
        }
    }

    /// Human-readable command line, for logs and `last_command`.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The small vocabulary of container operations the runtime services use.
///
/// Lifecycle calls are async. Execution is expressed as the host argv that
/// runs `exec` inside the container, so callers can spawn it through
/// `tokio::process` or a pseudo-terminal as they need.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    fn exec_argv(&self, container: &str, exec: &ExecSpec) -> Vec<String>;
}

/// Docker Engine API for lifecycle, the `docker` CLI for exec.
pub struct DockerRuntime {
    docker: Docker,
    cli: String,
    stop_timeout_secs: i32,
    in_container_timeout: bool,
}

impl DockerRuntime {
    pub fn connect(container: &ContainerSection, exec: &ExecSection) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::external("connect", "docker", e))?;
        Ok(Self {
            docker,
            cli: container.docker_cli.clone(),
            stop_timeout_secs: i32::try_from(container.stop_timeout_secs).unwrap_or(i32::MAX),
            in_container_timeout: exec.in_container_timeout,
        })
    }

    async fn inspect_running(&self, name: &str) -> Result<Option<bool>, RuntimeError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(
                info.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(RuntimeError::external("inspect", name, e)),
        }
    }
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.inspect_running(name).await?.is_some())
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.inspect_running(name).await?.unwrap_or(false))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let bind = format!("{}:{}:rw", spec.source.display(), spec.workdir);
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.keepalive.clone()),
            working_dir: Some(spec.workdir.clone()),
            labels: Some(HashMap::from([(
                PROJECT_LABEL.to_string(),
                spec.project.clone(),
            )])),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        debug!(container = %spec.name, image = %spec.image, "Creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await
            .map_err(|e| RuntimeError::external("create", &spec.name, e))?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            // 304: already started
            Err(e) if status_code(&e) != Some(304) => {
                Err(RuntimeError::external("start", name, e))
            }
            _ => Ok(()),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(
                name,
                Some(
                    StopContainerOptionsBuilder::new()
                        .t(self.stop_timeout_secs)
                        .build(),
                ),
            )
            .await
        {
            // 304: already stopped
            Err(e) if status_code(&e) != Some(304) => Err(RuntimeError::external("stop", name, e)),
            _ => Ok(()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
            .map_err(|e| RuntimeError::external("remove", name, e))
    }

    fn exec_argv(&self, container: &str, exec: &ExecSpec) -> Vec<String> {
        build_exec_argv(&self.cli, self.in_container_timeout, container, exec)
    }
}

/// Host argv for `docker exec` of `exec` in `container`.
pub fn build_exec_argv(
    cli: &str,
    in_container_timeout: bool,
    container: &str,
    exec: &ExecSpec,
) -> Vec<String> {
    let mut argv = vec![cli.to_string(), "exec".to_string()];
    if exec.interactive {
        argv.push("-i".to_string());
    }
    if exec.tty {
        argv.push("-t".to_string());
    }
    argv.push("-w".to_string());
    argv.push(exec.workdir.clone());
    for (key, value) in &exec.env {
        argv.push("-e".to_string());
        argv.push(format!("{}={}", key, value));
    }
    argv.push(container.to_string());

    // Killing the local client does not reach the process inside the
    // container. timeout(1) does.
    if in_container_timeout && let Some(deadline) = exec.deadline {
        let secs = deadline.as_secs() + u64::from(deadline.subsec_nanos() > 0);
        argv.extend([
            "timeout".to_string(),
            "-k".to_string(),
            "2".to_string(),
            secs.max(1).to_string(),
        ]);
    }

    argv.push(exec.command.clone());
    argv.extend(exec.args.iter().cloned());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_argv_shape() {
        let mut spec = ExecSpec::new(
            "python",
            vec!["app.py".to_string(), "--port".to_string(), "8080".to_string()],
            "/workspace/backend",
        );
        spec.env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        let argv = build_exec_argv("docker", false, "ai_builder_demo", &spec);
        assert_eq!(
            argv,
            vec![
                "docker",
                "exec",
                "-w",
                "/workspace/backend",
                "-e",
                "PYTHONUNBUFFERED=1",
                "ai_builder_demo",
                "python",
                "app.py",
                "--port",
                "8080"
            ]
        );
    }

    #[test]
    fn test_exec_argv_interactive_tty() {
        let spec = ExecSpec {
            tty: true,
            interactive: true,
            ..ExecSpec::new("/bin/bash", vec![], "/workspace")
        };
        let argv = build_exec_argv("docker", true, "c", &spec);
        assert_eq!(argv[..4], ["docker", "exec", "-i", "-t"]);
        assert_eq!(argv.last().map(String::as_str), Some("/bin/bash"));
    }

    #[test]
    fn test_exec_argv_wraps_deadline_in_timeout() {
        let spec = ExecSpec {
            deadline: Some(Duration::from_millis(2500)),
            ..ExecSpec::new("pytest", vec![], "/workspace")
        };
        let argv = build_exec_argv("docker", true, "c", &spec);
        let tail: Vec<_> = argv.iter().skip_while(|a| *a != "c").skip(1).collect();
        assert_eq!(tail, vec!["timeout", "-k", "2", "3", "pytest"]);

        let argv = build_exec_argv("docker", false, "c", &spec);
        assert!(!argv.iter().any(|a| a == "timeout"));
    }

    #[test]
    fn test_command_line() {
        let spec = ExecSpec::new("pip", vec!["install".into(), "-r".into(), "requirements.txt".into()], "/w");
        assert_eq!(spec.command_line(), "pip install -r requirements.txt");
    }
}
