use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::docker::{ContainerRuntime, ExecSpec};
use super::output::OutputBuffer;
use super::paths::resolve_workdir;
use crate::errors::RuntimeError;

/// Prints the in-container pid on the first stdout line, then becomes the
/// requested command.
const PID_WRAPPER: &str = "echo $$; exec \"$@\"";

/// Sends SIGTERM to `$1` inside the container.
const KILL_SCRIPT: &str = "kill -TERM \"$1\"";

/// How long `stop` waits for a just-launched process to report its pid.
const PID_WAIT: Duration = Duration::from_secs(2);

/// Snapshot of a managed process for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub project: String,
    pub container: String,
    pub command: String,
    /// Pid of the host-side exec client.
    pub pid: Option<u32>,
    /// Pid of the command inside the container, once reported.
    pub container_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub dropped_stdout: u64,
    pub dropped_stderr: u64,
}

/// A long-running command inside a project container, with its output
/// drained into two bounded line buffers.
pub struct ManagedProcess {
    project: String,
    container: String,
    command: String,
    pid: Option<u32>,
    container_pid: watch::Receiver<Option<u32>>,
    started_at: DateTime<Utc>,
    stdout: Arc<OutputBuffer<String>>,
    stderr: Arc<OutputBuffer<String>>,
    alive: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<std::sync::Mutex<Option<i32>>>,
}

impl ManagedProcess {
    pub fn project(&self) -> &str {
        &self.project
    }

    /// False once both output streams have closed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// `None` while running, or when the process was ended by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_stdout(&self) -> Option<String> {
        self.stdout.pop()
    }

    pub fn next_stderr(&self) -> Option<String> {
        self.stderr.pop()
    }

    pub fn drain_stdout(&self, max: usize) -> Vec<String> {
        self.stdout.drain(max)
    }

    pub fn drain_stderr(&self, max: usize) -> Vec<String> {
        self.stderr.drain(max)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            project: self.project.clone(),
            container: self.container.clone(),
            command: self.command.clone(),
            pid: self.pid,
            container_pid: *self.container_pid.borrow(),
            started_at: self.started_at,
            alive: self.is_alive(),
            exit_code: self.exit_code(),
            dropped_stdout: self.stdout.dropped(),
            dropped_stderr: self.stderr.dropped(),
        }
    }

    /// SIGTERM the host-side exec client.
    fn signal_client(&self) {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                project = %self.project,
                pid,
                error = %std::io::Error::last_os_error(),
                "Failed to signal exec client"
            );
        }
    }
}

/// Tracks at most one managed process per project.
pub struct ProcessSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    workdir: String,
    buffer_lines: usize,
    processes: Mutex<HashMap<String, Arc<ManagedProcess>>>,
}

impl ProcessSupervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        workdir: impl Into<String>,
        buffer_lines: usize,
    ) -> Self {
        Self {
            runtime,
            workdir: workdir.into(),
            buffer_lines,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Launch `command` in `container` and start draining its output.
    ///
    /// The command must already have passed the command policy. Fails with
    /// `AlreadyRunning` while the project's previous process has not exited;
    /// an exited one is replaced.
    pub async fn start(
        &self,
        project: &str,
        container: &str,
        command: &str,
        args: &[String],
        cwd: Option<&str>,
        env: BTreeMap<String, String>,
    ) -> Result<Arc<ManagedProcess>, RuntimeError> {
        let workdir = resolve_workdir(&self.workdir, cwd)?;

        // Held across check, spawn and insert so concurrent starts for one
        // project cannot both register.
        let mut processes = self.processes.lock().await;
        if let Some(existing) = processes.get(project)
            && !existing.has_exited()
        {
            return Err(RuntimeError::AlreadyRunning {
                project: project.to_string(),
            });
        }

        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let wrapped: Vec<String> = ["-c", PID_WRAPPER, "sh", command]
            .into_iter()
            .map(str::to_string)
            .chain(args.iter().cloned())
            .collect();
        let spec = ExecSpec {
            env,
            ..ExecSpec::new("sh", wrapped, workdir)
        };
        let argv = self.runtime.exec_argv(container, &spec);
        let Some((program, rest)) = argv.split_first() else {
            return Err(RuntimeError::InvalidInput("empty exec argv".to_string()));
        };

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::external("exec", container, e))?;

        let (pid_tx, pid_rx) = watch::channel(None);
        let process = Arc::new(ManagedProcess {
            project: project.to_string(),
            container: container.to_string(),
            command: command_line,
            pid: child.id(),
            container_pid: pid_rx,
            started_at: Utc::now(),
            stdout: Arc::new(OutputBuffer::new(self.buffer_lines)),
            stderr: Arc::new(OutputBuffer::new(self.buffer_lines)),
            alive: Arc::new(AtomicBool::new(true)),
            exited: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(std::sync::Mutex::new(None)),
        });

        let open_streams = Arc::new(AtomicUsize::new(2));
        tokio::spawn(drain_lines(
            child.stdout.take(),
            process.stdout.clone(),
            Some(pid_tx),
            open_streams.clone(),
            process.alive.clone(),
        ));
        tokio::spawn(drain_lines(
            child.stderr.take(),
            process.stderr.clone(),
            None,
            open_streams,
            process.alive.clone(),
        ));

        let waiter = process.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(project = %waiter.project, error = %e, "Failed to wait for managed process");
                    None
                }
            };
            *waiter.exit_code.lock().unwrap_or_else(|e| e.into_inner()) = code;
            waiter.exited.store(true, Ordering::SeqCst);
            debug!(project = %waiter.project, exit_code = ?code, "Managed process exited");
        });

        info!(project = %project, container = %container, command = %process.command, "Started managed process");
        processes.insert(project.to_string(), process.clone());
        Ok(process)
    }

    /// Forget the project's process and terminate it if still running.
    /// Returns whether a process was tracked.
    pub async fn stop(&self, project: &str) -> bool {
        let removed = self.processes.lock().await.remove(project);
        match removed {
            Some(process) => {
                self.terminate(&process).await;
                info!(project = %project, "Stopped managed process");
                true
            }
            None => false,
        }
    }

    /// Request termination with SIGTERM. Never escalates to SIGKILL.
    ///
    /// The signal goes to the in-container pid through the runtime, since
    /// signalling the exec client does not reach the container. The client
    /// is signalled only when the pid is unknown or the kill cannot be run.
    async fn terminate(&self, process: &ManagedProcess) {
        if process.has_exited() {
            return;
        }
        let mut pid_rx = process.container_pid.clone();
        let pid = match tokio::time::timeout(PID_WAIT, pid_rx.wait_for(Option::is_some)).await {
            Ok(Ok(pid)) => *pid,
            _ => None,
        };

        if let Some(pid) = pid {
            let spec = ExecSpec::new(
                "sh",
                vec![
                    "-c".to_string(),
                    KILL_SCRIPT.to_string(),
                    "sh".to_string(),
                    pid.to_string(),
                ],
                self.workdir.clone(),
            );
            let argv = self.runtime.exec_argv(&process.container, &spec);
            match run_to_completion(&argv).await {
                Ok(true) => return,
                Ok(false) => {
                    debug!(project = %process.project, pid, "In-container kill did not succeed");
                }
                Err(e) => {
                    warn!(project = %process.project, pid, error = %e, "Failed to run in-container kill");
                }
            }
        }
        process.signal_client();
    }

    pub async fn has_process(&self, project: &str) -> bool {
        self.processes.lock().await.contains_key(project)
    }

    pub async fn get_process(&self, project: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.lock().await.get(project).cloned()
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.processes.lock().await.drain().collect();
        for (project, process) in drained {
            self.terminate(&process).await;
            debug!(project = %project, "Stopped managed process on shutdown");
        }
    }
}

/// Push lines into `buffer` until the stream closes. Invalid UTF-8 is
/// replaced, never fatal. With `pid_slot`, the first line is taken as the
/// in-container pid. The last stream to close marks the process not-alive.
async fn drain_lines<R: AsyncRead + Unpin>(
    stream: Option<R>,
    buffer: Arc<OutputBuffer<String>>,
    mut pid_slot: Option<watch::Sender<Option<u32>>>,
    open_streams: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
) {
    if let Some(stream) = stream {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Managed process output read failed");
                    break;
                }
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(slot) = pid_slot.take()
                && let Ok(pid) = line.trim().parse::<u32>()
            {
                let _ = slot.send(Some(pid));
                continue;
            }
            buffer.push(line.to_string());
        }
    }
    if open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
        alive.store(false, Ordering::SeqCst);
    }
}

/// Run `argv` with no I/O and report whether it exited successfully.
async fn run_to_completion(argv: &[String]) -> std::io::Result<bool> {
    let Some((program, rest)) = argv.split_first() else {
        return Ok(false);
    };
    let status = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}
