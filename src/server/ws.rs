use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    body::Bytes,
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::SharedState;
use crate::runtime::{ManagedProcess, TerminalSession};

/// Idle wait between polls of a managed process's output buffers.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval at which terminal output is forwarded to the client.
const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lines forwarded per stream per poll.
const LOG_BATCH: usize = 256;

// ── Logs ─────────────────────────────────────────────────────────────

pub async fn logs_handler(
    ws: WebSocketUpgrade,
    Path(project): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_logs(socket, project, state))
}

async fn stream_logs(mut socket: WebSocket, project: String, state: SharedState) {
    let Some(process) = state.processes.get_process(&project).await else {
        let _ = socket
            .send(Message::Text("ERROR: No running process".into()))
            .await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (mut sender, mut receiver) = socket.split();
    let mut poll = tokio::time::interval(LOG_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                // Read the flag before draining so lines written just before
                // exit are still forwarded.
                let finished = !process.is_alive();
                if forward_logs(&process, &mut sender).await.is_err() {
                    break;
                }
                if finished {
                    let _ = sender.send(Message::Text("[process exited]".into())).await;
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    debug!(project = %project, "Log stream closed");
}

async fn forward_logs<S>(process: &ManagedProcess, sender: &mut S) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    loop {
        let stdout = process.drain_stdout(LOG_BATCH);
        let stderr = process.drain_stderr(LOG_BATCH);
        if stdout.is_empty() && stderr.is_empty() {
            return Ok(());
        }
        for line in stdout {
            sender.send(Message::Text(line.trim_end().to_string().into())).await?;
        }
        for line in stderr {
            sender
                .send(Message::Text(format!("[stderr] {}", line.trim_end()).into()))
                .await?;
        }
    }
}

// ── Terminal ─────────────────────────────────────────────────────────

/// Control frames the client may send instead of raw input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalControl {
    Resize { rows: u16, cols: u16 },
}

pub async fn terminal_handler(
    ws: WebSocketUpgrade,
    Path(project): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_terminal(socket, project, state))
}

async fn run_terminal(mut socket: WebSocket, project: String, state: SharedState) {
    let record = match state.lifecycle.status(&project).await {
        Ok(record) if record.is_running() => record,
        Ok(_) => {
            let _ = socket.send(Message::Text("Container not running".into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Err(e) => {
            let _ = socket.send(Message::Text(e.to_string().into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let session = match state
        .terminals
        .get_or_create(&project, &record.container_name)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(project = %project, error = %e, "Failed to open terminal");
            let _ = socket.send(Message::Text(e.to_string().into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let mut poll = tokio::time::interval(TERMINAL_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let mut failed = false;
                while let Some(chunk) = session.read() {
                    if sender.send(Message::Text(chunk.into())).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed || !session.is_alive() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let input = TerminalInput::Text(text.as_str().to_string());
                        deliver_input(session.clone(), input).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        deliver_input(session.clone(), TerminalInput::Raw(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    // The session lives exactly as long as its socket.
    state.terminals.close(&project).await;
    let _ = sender.send(Message::Close(None)).await;
    debug!(project = %project, "Terminal socket closed");
}

enum TerminalInput {
    /// Keystrokes, or a JSON control frame.
    Text(String),
    Raw(Bytes),
}

/// PTY writes and resizes can block, so they run on the blocking pool.
async fn deliver_input(session: Arc<TerminalSession>, input: TerminalInput) {
    let project = session.project().to_string();
    let delivered = tokio::task::spawn_blocking(move || match input {
        TerminalInput::Text(text) => handle_terminal_input(&session, &text),
        TerminalInput::Raw(data) => {
            if let Err(e) = session.write(&data) {
                warn!(project = %session.project(), error = %e, "Terminal write failed");
            }
        }
    })
    .await;
    if let Err(e) = delivered {
        warn!(project = %project, error = %e, "Terminal input task failed");
    }
}

fn handle_terminal_input(session: &TerminalSession, text: &str) {
    if text.starts_with('{')
        && let Ok(TerminalControl::Resize { rows, cols }) = serde_json::from_str(text)
    {
        if let Err(e) = session.resize(rows, cols) {
            warn!(project = %session.project(), error = %e, "Terminal resize failed");
        }
        return;
    }
    if let Err(e) = session.write(text.as_bytes()) {
        warn!(project = %session.project(), error = %e, "Terminal write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TerminalManager;
    use crate::runtime::testing::FakeRuntime;

    #[test]
    fn test_resize_control_parses() {
        let msg: TerminalControl =
            serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        let TerminalControl::Resize { rows, cols } = msg;
        assert_eq!((rows, cols), (40, 120));
    }

    #[test]
    fn test_plain_json_input_is_not_control() {
        assert!(serde_json::from_str::<TerminalControl>(r#"{"type":"other"}"#).is_err());
        assert!(serde_json::from_str::<TerminalControl>("ls -la").is_err());
    }

    #[tokio::test]
    async fn test_input_reaches_shell_off_the_async_workers() {
        let terminals =
            TerminalManager::new(Arc::new(FakeRuntime::new()), "/bin/sh", "/workspace", 256);
        let session = terminals.get_or_create("demo", "c").await.unwrap();

        deliver_input(
            session.clone(),
            TerminalInput::Text(r#"{"type":"resize","rows":30,"cols":100}"#.to_string()),
        )
        .await;
        let typed = TerminalInput::Text("echo ws-$((1+1))\n".to_string());
        deliver_input(session.clone(), typed).await;
        let raw = TerminalInput::Raw(Bytes::from_static(b"echo raw-$((2+2))\n"));
        deliver_input(session.clone(), raw).await;

        let mut collected = String::new();
        for _ in 0..250 {
            while let Some(chunk) = session.read() {
                collected.push_str(&chunk);
            }
            if collected.contains("ws-2") && collected.contains("raw-4") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(collected.contains("ws-2"), "{collected:?}");
        assert!(collected.contains("raw-4"), "{collected:?}");
        terminals.close_all().await;
    }
}
