//! Typed error hierarchy for the runtime services.
//!
//! - `RuntimeError`: every failure a lifecycle, exec, process or terminal
//!   operation can report to its caller
//! - `PolicyViolation`: the specific command-policy rule a command broke

use std::time::Duration;

use thiserror::Error;

/// The command-policy rule that rejected a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error("Command not allowed: {command}")]
    CommandNotAllowed { command: String },

    #[error("Blocked pattern detected in {field}: {pattern}")]
    BlockedPattern { field: String, pattern: String },

    #[error("Argument not allowed for '{command}': {argument}")]
    ArgumentNotAllowed { command: String, argument: String },

    #[error("Flag '{flag}' requires a value")]
    MissingFlagValue { flag: String },

    #[error("Absolute paths are not allowed: {value}")]
    AbsolutePath { value: String },
}

/// Errors surfaced by the runtime services.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No runtime found for project: {project}")]
    RuntimeNotFound { project: String },

    #[error("Project not found: {project}")]
    ProjectNotFound { project: String },

    #[error("No managed process for project: {project}")]
    ProcessNotFound { project: String },

    #[error("Runtime already exists for project: {project}")]
    AlreadyExists { project: String },

    #[error("Process already running for project: {project}")]
    AlreadyRunning { project: String },

    #[error("Runtime is not running for project: {project}")]
    NotRunning { project: String },

    #[error("Command rejected: {0}")]
    PolicyRejected(#[from] PolicyViolation),

    #[error("Container runtime failed during {operation} on {target}: {message}")]
    External {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("Command execution timed out after {}s", .timeout.as_secs_f64())]
    Timeout { timeout: Duration },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Runtime store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Runtime store unavailable: {0}")]
    StoreUnavailable(String),
}

impl RuntimeError {
    pub fn external(
        operation: &'static str,
        target: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::External {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// True for any "does not exist" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RuntimeNotFound { .. } | Self::ProjectNotFound { .. } | Self::ProcessNotFound { .. }
        )
    }
}
