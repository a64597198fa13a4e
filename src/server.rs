use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Durable description of one managed server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Advisory only. Shown to operators, never enforced.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub created_at: u64,
}

impl ServerConfig {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        command: impl Into<String>,
        args: Vec<String>,
        port: Option<u16>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            command: command.into(),
            args,
            port,
            created_at: now_epoch_secs(),
        }
    }

    /// The configured path when it is a directory, otherwise its parent.
    pub fn working_dir(&self) -> PathBuf {
        if self.path.is_file() {
            self.path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            self.path.clone()
        }
    }

    /// Arguments handed to the command. A script path is passed last.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.path.is_file() {
            args.push(self.path.display().to_string());
        }
        args
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.launch_args());
        shell_words::join(parts)
    }
}

fn default_command() -> String {
    "node".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ServerState {
    /// Stopped and Crashed: no OS process exists for the server.
    pub fn is_resting(self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Crashed)
    }

    pub fn is_active(self) -> bool {
        !self.is_resting()
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
        };
        write!(f, "{value}")
    }
}

/// Runtime view of a server, owned by its supervisor actor.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProcessRuntime {
    pub state: ServerState,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub detected_port: Option<u16>,
    #[serde(default)]
    pub dropped_lines: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerView {
    pub config: ServerConfig,
    pub runtime: ProcessRuntime,
}

impl ServerView {
    /// Configured port first, then whatever the server announced on its output.
    pub fn effective_port(&self) -> Option<u16> {
        self.config.port.or(self.runtime.detected_port)
    }
}

/// Named group of servers started and stopped together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub name: String,
    pub from: ServerState,
    pub to: ServerState,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub server: String,
    pub timestamp_ms: u64,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub server: String,
    pub timestamp_ms: u64,
    pub stream: LogStream,
    #[serde(default)]
    pub severity: Severity,
    pub text: String,
}

/// Push feed for collaborators that do not want to poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HerdEvent {
    Status(StatusChange),
    Sample(MetricSample),
    Log(LogLine),
}

impl HerdEvent {
    pub fn server(&self) -> &str {
        match self {
            HerdEvent::Status(change) => &change.name,
            HerdEvent::Sample(sample) => &sample.server,
            HerdEvent::Log(line) => &line.server,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wait_error: bool,
}

impl ChildExit {
    pub fn describe(&self) -> String {
        if self.wait_error {
            return "failed to wait for process exit".to_string();
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "exited".to_string(),
        }
    }
}

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
