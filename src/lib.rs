//! Per-project container runtimes: policy-checked command execution,
//! supervised long-running processes and interactive PTY terminals, served
//! over HTTP and WebSocket.

pub mod config;
pub mod errors;
pub mod runtime;
pub mod server;
