//! Per-project container runtimes.
//!
//! ## Overview
//!
//! Every generated project gets one isolated container with its source
//! directory bind-mounted at a fixed workdir. Callers can run one-shot
//! commands in it, supervise a single long-running process, or attach an
//! interactive terminal. Container state is persisted; process and terminal
//! state live only in memory.
//!
//! ## Module Map
//!
//! ```text
//!  request ──> lifecycle.rs  (LifecycleManager: create/start/stop/remove)
//!                 │    │
//!                 │    └── store.rs   (RuntimeStore: SQLite, spawn_blocking)
//!                 v
//!              docker.rs     (ContainerRuntime trait, DockerRuntime)
//!                 ^
//!                 │ exec_argv()
//!    ┌────────────┼──────────────────────┐
//!    │            │                      │
//!  executor.rs  process.rs           terminal.rs
//!  (one-shot)   (ProcessSupervisor)  (TerminalManager, PTY)
//!    │            │                      │
//!    └─ policy.rs ┘                      └── output.rs (bounded buffers)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `policy`    | `CommandPolicy`: allowlist + blocked-pattern validation |
//! | `paths`     | `ProjectResolver`, in-container workdir resolution      |
//! | `output`    | `OutputBuffer`: bounded queue drained by consumers      |
//! | `reconcile` | Startup correction of persisted status                  |
//!
//! Terminals are deliberately outside the command policy: they are operator
//! sessions, while exec and managed processes take untrusted input.

pub mod docker;
pub mod executor;
pub mod lifecycle;
pub mod output;
pub mod paths;
pub mod policy;
pub mod process;
pub mod reconcile;
pub mod store;
pub mod terminal;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::{ContainerRuntime, ContainerSpec, DockerRuntime, ExecSpec};
pub use executor::{CommandExecutor, ExecRequest};
pub use lifecycle::LifecycleManager;
pub use output::OutputBuffer;
pub use paths::ProjectResolver;
pub use policy::CommandPolicy;
pub use process::{ManagedProcess, ProcessInfo, ProcessSupervisor};
pub use reconcile::{ReconcileReport, reconcile};
pub use store::{RuntimeDb, RuntimeStore};
pub use terminal::{TerminalManager, TerminalSession};
