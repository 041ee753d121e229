//! Unified configuration for runway, read from `runway.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so an
//! absent file yields a working configuration for a local Docker daemon.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = ".runway/runtime.db"
//!
//! [projects]
//! root = "generated_projects"
//!
//! [container]
//! image = "python:3.11-slim"
//! name_prefix = "ai_builder_"
//! workdir = "/workspace"
//! memory = "2g"
//! cpus = 2.0
//!
//! [exec]
//! default_timeout_secs = 60
//! max_timeout_secs = 600
//!
//! [output]
//! process_buffer_lines = 10000
//! terminal_buffer_chunks = 4096
//!
//! [policy]
//! forbid_path_separators = false
//!
//! [policy.commands.pip]
//! allowed_args = ["install", "list", "freeze", "-r"]
//! value_flags = ["-r"]
//!
//! [logging]
//! filter = "info"
//! format = "pretty"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "runway.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub projects: ProjectsSection,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub exec: ExecSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a locally served frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".runway/runtime.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsSection {
    /// Directory holding one sub-directory per generated project.
    #[serde(default = "default_projects_root")]
    pub root: PathBuf,
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("generated_projects")
}

impl Default for ProjectsSection {
    fn default() -> Self {
        Self {
            root: default_projects_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Mount point of the project source inside the container.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Placeholder process that keeps an idle container alive.
    #[serde(default = "default_keepalive")]
    pub keepalive: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_docker_cli")]
    pub docker_cli: String,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u32,
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_name_prefix() -> String {
    "ai_builder_".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_keepalive() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_stop_timeout_secs() -> u32 {
    10
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            name_prefix: default_name_prefix(),
            workdir: default_workdir(),
            memory: default_memory(),
            cpus: default_cpus(),
            keepalive: default_keepalive(),
            shell: default_shell(),
            docker_cli: default_docker_cli(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl ContainerSection {
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory(&self.memory)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSection {
    #[serde(default = "default_exec_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_exec_timeout")]
    pub max_timeout_secs: u64,
    /// Also enforce the deadline inside the container with `timeout(1)`, so
    /// the process is reclaimed even though killing the local client does not
    /// reach it.
    #[serde(default = "default_true")]
    pub in_container_timeout: bool,
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_max_exec_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_exec_timeout(),
            max_timeout_secs: default_max_exec_timeout(),
            in_container_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    /// Lines kept per stream of a managed process before the oldest are dropped.
    #[serde(default = "default_process_buffer_lines")]
    pub process_buffer_lines: usize,
    /// Chunks kept per terminal session before the oldest are dropped.
    #[serde(default = "default_terminal_buffer_chunks")]
    pub terminal_buffer_chunks: usize,
}

fn default_process_buffer_lines() -> usize {
    10_000
}

fn default_terminal_buffer_chunks() -> usize {
    4_096
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            process_buffer_lines: default_process_buffer_lines(),
            terminal_buffer_chunks: default_terminal_buffer_chunks(),
        }
    }
}

/// Argument rules for one allowlisted executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRule {
    /// Any argument is accepted (still subject to the blocked patterns).
    #[serde(default)]
    pub any_args: bool,
    #[serde(default)]
    pub allowed_args: Vec<String>,
    /// Flags whose following argument is a path, checked as a path instead
    /// of against `allowed_args`.
    #[serde(default)]
    pub value_flags: Vec<String>,
}

impl CommandRule {
    fn any() -> Self {
        Self {
            any_args: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Reject `/` anywhere in arguments and cwd, not only leading `/`.
    #[serde(default)]
    pub forbid_path_separators: bool,
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_commands")]
    pub commands: BTreeMap<String, CommandRule>,
}

fn default_blocked_patterns() -> Vec<String> {
    [
        r";", r"&&", r"\|\|", r"\|", r"`", r"\$\(", r"\.\.", r"~", r"sudo", r"ssh", r"scp",
        r"curl", r"wget", r"rm\s+-rf", r"chmod", r"chown", r"kill", r"pkill", r"mount",
        r"umount",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_commands() -> BTreeMap<String, CommandRule> {
    let mut commands = BTreeMap::new();
    for name in ["python", "flask", "uvicorn", "streamlit", "pytest"] {
        commands.insert(name.to_string(), CommandRule::any());
    }
    commands.insert(
        "pip".to_string(),
        CommandRule {
            any_args: false,
            allowed_args: ["install", "list", "freeze", "-r"]
                .iter()
                .map(|a| a.to_string())
                .collect(),
            value_flags: vec!["-r".to_string()],
        },
    );
    commands
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            forbid_path_separators: false,
            blocked_patterns: default_blocked_patterns(),
            commands: default_commands(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUNWAY_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

impl RunwayConfig {
    /// Load configuration from `path`, or from `runway.toml` when no path is
    /// given. A missing default file yields defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if explicit {
                bail!("Config file {} does not exist", path.display());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: RunwayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Apply `RUNWAY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db_path) = lookup("RUNWAY_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(root) = lookup("RUNWAY_PROJECTS_ROOT") {
            self.projects.root = PathBuf::from(root);
        }
        if let Some(port) = lookup("RUNWAY_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid RUNWAY_PORT '{}'", port))?;
        }
        if let Some(image) = lookup("RUNWAY_IMAGE") {
            self.container.image = image;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.container.name_prefix.is_empty() {
            bail!("container.name_prefix cannot be empty");
        }
        if !self.container.workdir.starts_with('/') {
            bail!(
                "container.workdir '{}' must be an absolute path",
                self.container.workdir
            );
        }
        if self.container.cpus <= 0.0 {
            bail!("container.cpus must be positive");
        }
        if self.container.keepalive.is_empty() {
            bail!("container.keepalive cannot be empty");
        }
        self.container.memory_bytes()?;
        if self.exec.default_timeout_secs == 0 {
            bail!("exec.default_timeout_secs must be positive");
        }
        if self.exec.default_timeout_secs > self.exec.max_timeout_secs {
            bail!(
                "exec.default_timeout_secs ({}) exceeds exec.max_timeout_secs ({})",
                self.exec.default_timeout_secs,
                self.exec.max_timeout_secs
            );
        }
        if self.output.process_buffer_lines == 0 || self.output.terminal_buffer_chunks == 0 {
            bail!("output buffer sizes must be positive");
        }
        if self.policy.commands.is_empty() {
            bail!("policy.commands cannot be empty");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Parse a Docker-style memory size (`512m`, `2g`, `1048576`) into bytes.
pub fn parse_memory(value: &str) -> Result<i64> {
    let trimmed = value.trim().to_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some('b') => (&trimmed[..trimmed.len() - 1], 1),
        Some(_) => (trimmed.as_str(), 1),
        None => bail!("Memory size cannot be empty"),
    };
    let amount: i64 = digits
        .parse()
        .with_context(|| format!("Invalid memory size '{}'", value))?;
    if amount <= 0 {
        bail!("Memory size must be positive: '{}'", value);
    }
    amount
        .checked_mul(multiplier)
        .with_context(|| format!("Memory size '{}' is too large", value))
}
