use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use runway_common::ExecOutput;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::docker::{ContainerRuntime, ExecSpec};
use super::paths::resolve_workdir;
use super::policy::CommandPolicy;
use super::store::RuntimeStore;
use crate::config::ExecSection;
use crate::errors::RuntimeError;

/// Exit status `timeout(1)` reports when it had to stop the command.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    /// Falls back to the configured default; capped at the configured max.
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

/// Runs one-shot, policy-checked commands in a project's running container.
pub struct CommandExecutor {
    store: RuntimeStore,
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<CommandPolicy>,
    workdir: String,
    config: ExecSection,
}

impl CommandExecutor {
    pub fn new(
        store: RuntimeStore,
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<CommandPolicy>,
        workdir: impl Into<String>,
        config: ExecSection,
    ) -> Self {
        Self {
            store,
            runtime,
            policy,
            workdir: workdir.into(),
            config,
        }
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Result<Duration, RuntimeError> {
        let max = Duration::from_secs(self.config.max_timeout_secs);
        let timeout = requested.unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        if timeout.is_zero() {
            return Err(RuntimeError::InvalidInput(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(timeout.min(max))
    }

    /// Validate and run `request` in `project`'s container, returning the
    /// exit code and trimmed output. The process is killed if it outlives
    /// the timeout.
    pub async fn exec(
        &self,
        project: &str,
        request: ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        let record = self.store.get(project).await?;
        if !record.is_running() {
            return Err(RuntimeError::NotRunning {
                project: project.to_string(),
            });
        }

        self.policy
            .validate(&request.command, &request.args, request.cwd.as_deref())?;

        let workdir = resolve_workdir(&self.workdir, request.cwd.as_deref())?;
        let timeout = self.effective_timeout(request.timeout)?;
        let spec = ExecSpec {
            env: request.env,
            deadline: Some(timeout),
            ..ExecSpec::new(request.command, request.args, workdir)
        };
        let command_line = spec.command_line();
        let argv = self.runtime.exec_argv(&record.container_name, &spec);
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::InvalidInput("empty exec argv".to_string()));
        };

        debug!(project = %project, command = %command_line, timeout_secs = timeout.as_secs_f64(), "Executing command");
        let started = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::external("exec", &record.container_name, e))?;
        let group = child.id().and_then(|pid| i32::try_from(pid).ok());

        // One deadline covers the exit and both pipes: a backgrounded
        // descendant can hold the pipes open after the command returns.
        let (out, err) = (child.stdout.take(), child.stderr.take());
        let finished = tokio::time::timeout(timeout, async {
            tokio::join!(child.wait(), read_all(out), read_all(err))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok((status, stdout, stderr)) => (
                status.map_err(|e| RuntimeError::external("exec", &record.container_name, e))?,
                stdout,
                stderr,
            ),
            Err(_) => {
                kill_group(group);
                if let Err(e) = child.kill().await {
                    debug!(project = %project, error = %e, "Timed-out command already exited");
                }
                warn!(project = %project, command = %command_line, "Command timed out");
                return Err(RuntimeError::Timeout { timeout });
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        if exit_code == TIMEOUT_EXIT_CODE && started.elapsed() >= timeout {
            return Err(RuntimeError::Timeout { timeout });
        }

        if let Err(e) = self.store.update_last_command(project, &command_line).await {
            warn!(project = %project, error = %e, "Failed to record last command");
        }

        info!(project = %project, command = %command_line, exit_code, "Command finished");
        Ok(ExecOutput {
            exit_code,
            stdout: stdout.trim_end().to_string(),
            stderr: stderr.trim_end().to_string(),
        })
    }
}

/// SIGKILL the command's process group, reaching descendants that
/// outlived it.
fn kill_group(group: Option<i32>) {
    let Some(pgid) = group else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        // A read error just truncates the captured output.
        let _ = stream.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
