//! Shared domain types for the runway runtime platform.
//!
//! These types cross the boundary between the runtime services, the HTTP
//! layer and the persisted store, so they carry no behaviour beyond
//! conversions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a project's container.
///
/// Only container state is ever recorded here. Whatever runs inside the
/// container is tracked in memory by the supervisor, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    #[default]
    Stopped,
    Running,
}

impl RuntimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
        }
    }

    pub fn from_running(running: bool) -> Self {
        if running { Self::Running } else { Self::Stopped }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            _ => Err(format!("Invalid runtime status: {}", s)),
        }
    }
}

/// Persisted description of one project's container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub project_name: String,
    pub project_root: String,
    pub container_name: String,
    pub image: String,
    pub status: RuntimeStatus,
    pub last_command: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeRecord {
    pub fn is_running(&self) -> bool {
        self.status == RuntimeStatus::Running
    }
}

/// Captured result of a one-shot command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [RuntimeStatus::Stopped, RuntimeStatus::Running] {
            assert_eq!(status.as_str().parse::<RuntimeStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RuntimeStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RuntimeStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn from_running_maps_bool() {
        assert_eq!(RuntimeStatus::from_running(true), RuntimeStatus::Running);
        assert_eq!(RuntimeStatus::from_running(false), RuntimeStatus::Stopped);
    }
}
