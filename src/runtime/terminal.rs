use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::docker::{ContainerRuntime, ExecSpec};
use super::output::OutputBuffer;
use crate::errors::RuntimeError;

/// Interval at which the reader re-checks the alive flag while idle.
const POLL_INTERVAL_MS: i32 = 100;
const READ_CHUNK: usize = 4096;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// An interactive shell in a project container, on a host pseudo-terminal.
pub struct TerminalSession {
    project: String,
    container: String,
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    writer: std::sync::Mutex<Box<dyn Write + Send>>,
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output: Arc<OutputBuffer<String>>,
    alive: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TerminalSession {
    fn spawn(
        project: &str,
        container: &str,
        argv: Vec<String>,
        buffer_chunks: usize,
    ) -> Result<Self, RuntimeError> {
        let external = |e: &dyn std::fmt::Display| RuntimeError::external("terminal", container, e);
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::InvalidInput("empty exec argv".to_string()));
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| external(&e))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        let mut child = pair.slave.spawn_command(cmd).map_err(|e| external(&e))?;
        // Only the child may hold the slave, or the master never sees EOF.
        drop(pair.slave);

        let killer = child.clone_killer();
        let writer = pair.master.take_writer().map_err(|e| external(&e))?;
        let mut reader = pair.master.try_clone_reader().map_err(|e| external(&e))?;
        let fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| external(&"pseudo-terminal has no file descriptor"))?;

        let output = Arc::new(OutputBuffer::new(buffer_chunks));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_handle = {
            let output = output.clone();
            let alive = alive.clone();
            let project = project.to_string();
            std::thread::Builder::new()
                .name(format!("pty-{}", project))
                .spawn(move || {
                    read_loop(fd, &mut *reader, &output, &alive);
                    alive.store(false, Ordering::SeqCst);
                    debug!(project = %project, "Terminal reader finished");
                })
                .map_err(|e| external(&e))?
        };

        // Reap the shell so it does not linger as a zombie.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(Self {
            project: project.to_string(),
            container: container.to_string(),
            master: std::sync::Mutex::new(pair.master),
            writer: std::sync::Mutex::new(writer),
            killer: std::sync::Mutex::new(killer),
            output,
            alive,
            reader: std::sync::Mutex::new(Some(reader_handle)),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send input to the shell. Does nothing once the session is closed.
    pub fn write(&self, data: &[u8]) -> Result<(), RuntimeError> {
        if !self.is_alive() {
            return Ok(());
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| RuntimeError::external("terminal write", &self.container, e))
    }

    /// Take one buffered output chunk without waiting.
    pub fn read(&self) -> Option<String> {
        self.output.pop()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError> {
        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(size)
            .map_err(|e| RuntimeError::external("terminal resize", &self.container, e))
    }

    /// Mark the session dead and hang up the shell. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            self.join_reader();
            return;
        }
        if let Err(e) = self.killer.lock().unwrap_or_else(|e| e.into_inner()).kill() {
            debug!(project = %self.project, error = %e, "Terminal shell already gone");
        }
        self.join_reader();
    }

    fn join_reader(&self) {
        let handle = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(project = %self.project, "Terminal reader panicked");
        }
    }
}

/// Poll the master side and push decoded chunks until EOF, an error, or
/// the session is closed.
fn read_loop(fd: RawFd, reader: &mut dyn Read, output: &OutputBuffer<String>, alive: &AtomicBool) {
    let mut buf = [0u8; READ_CHUNK];
    let mut pending = Vec::new();
    pump(fd, reader, &mut buf, &mut pending, output, alive);
    if !pending.is_empty() {
        output.push(String::from_utf8_lossy(&pending).into_owned());
    }
}

fn pump(
    fd: RawFd,
    reader: &mut dyn Read,
    buf: &mut [u8],
    pending: &mut Vec<u8>,
    output: &OutputBuffer<String>,
    alive: &AtomicBool,
) {
    while alive.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
        if rc < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if rc == 0 {
            continue;
        }
        if pfd.revents & libc::POLLIN != 0 {
            match reader.read(buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    if let Some(text) = take_complete_utf8(pending) {
                        output.push(text);
                    }
                }
            }
        } else if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
            return;
        }
    }
}

/// Decode everything in `pending` except a trailing, still incomplete UTF-8
/// sequence, which stays for the next read.
fn take_complete_utf8(pending: &mut Vec<u8>) -> Option<String> {
    let split = pending.len() - incomplete_utf8_tail(pending);
    if split == 0 {
        return None;
    }
    let text = String::from_utf8_lossy(&pending[..split]).into_owned();
    pending.drain(..split);
    Some(text)
}

/// Length of a multi-byte sequence cut off at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Tracks at most one terminal session per project.
pub struct TerminalManager {
    runtime: Arc<dyn ContainerRuntime>,
    shell: String,
    workdir: String,
    buffer_chunks: usize,
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
}

impl TerminalManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        shell: impl Into<String>,
        workdir: impl Into<String>,
        buffer_chunks: usize,
    ) -> Self {
        Self {
            runtime,
            shell: shell.into(),
            workdir: workdir.into(),
            buffer_chunks,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the project's live session, or open a new shell.
    pub async fn get_or_create(
        &self,
        project: &str,
        container: &str,
    ) -> Result<Arc<TerminalSession>, RuntimeError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(project) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            existing.close();
        }

        let spec = ExecSpec {
            tty: true,
            interactive: true,
            env: BTreeMap::from([("TERM".to_string(), "xterm-256color".to_string())]),
            ..ExecSpec::new(&self.shell, Vec::new(), &self.workdir)
        };
        let argv = self.runtime.exec_argv(container, &spec);
        let (project_owned, container_owned, chunks) =
            (project.to_string(), container.to_string(), self.buffer_chunks);
        let session = tokio::task::spawn_blocking(move || {
            TerminalSession::spawn(&project_owned, &container_owned, argv, chunks)
        })
        .await
        .map_err(|e| RuntimeError::external("terminal", container, e))??;

        let session = Arc::new(session);
        sessions.insert(project.to_string(), session.clone());
        info!(project = %project, container = %container, "Opened terminal session");
        Ok(session)
    }

    pub async fn get(&self, project: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.lock().await.get(project).cloned()
    }

    /// Close and forget the project's session. No-op if there is none.
    pub async fn close(&self, project: &str) {
        let removed = self.sessions.lock().await.remove(project);
        if let Some(session) = removed {
            tokio::task::spawn_blocking(move || session.close())
                .await
                .unwrap_or_else(|e| warn!(project = %project, error = %e, "Terminal close failed"));
            info!(project = %project, "Closed terminal session");
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (project, _) in &drained {
            debug!(project = %project, "Closing terminal session on shutdown");
        }
        let _ = tokio::task::spawn_blocking(move || {
            for (_, session) in drained {
                session.close();
            }
        })
        .await;
    }
}
