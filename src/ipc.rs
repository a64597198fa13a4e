use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::engine::StackOutcome;
use crate::server::{HerdEvent, LogLine, MetricSample, ServerConfig, ServerView, Stack};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Ping,
    Shutdown,
    Add {
        config: ServerConfig,
    },
    Edit {
        name: String,
        config: ServerConfig,
    },
    Remove {
        name: String,
        #[serde(default)]
        force: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Restart {
        name: String,
    },
    List,
    Status {
        name: String,
    },
    Logs {
        name: String,
        lines: usize,
        /// Read the in-memory tail instead of the log file.
        #[serde(default)]
        live: bool,
    },
    LogsClear {
        name: String,
    },
    Metrics {
        name: String,
        #[serde(default)]
        since_ms: Option<u64>,
    },
    StackAdd {
        name: String,
        servers: Vec<String>,
    },
    StackEdit {
        name: String,
        servers: Vec<String>,
    },
    StackRemove {
        name: String,
    },
    StackList,
    StackStart {
        name: String,
    },
    StackStop {
        name: String,
    },
    /// Keeps the connection open and streams `HerdEvent`s after the reply.
    Watch {
        #[serde(default)]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    pub message: String,
    #[serde(default)]
    pub server: Option<ServerView>,
    #[serde(default)]
    pub servers: Vec<ServerView>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    #[serde(default)]
    pub samples: Vec<MetricSample>,
    #[serde(default)]
    pub stacks: Vec<Stack>,
    #[serde(default)]
    pub stack_results: Vec<StackOutcome>,
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            ..Self::default()
        }
    }
}

pub async fn send_request(daemon_addr: &str, request: &IpcRequest) -> Result<IpcResponse> {
    let mut stream = TcpStream::connect(daemon_addr)
        .await
        .with_context(|| format!("failed to connect to daemon at {daemon_addr}"))?;
    write_json_line(&mut stream, request).await?;
    read_json_line(&mut stream).await
}

/// Event feed opened by [`watch`].
pub struct EventStream {
    reader: BufReader<TcpStream>,
    line: String,
}

impl EventStream {
    /// Next event, or `None` once the daemon closes the stream.
    pub async fn next(&mut self) -> Result<Option<HerdEvent>> {
        self.line.clear();
        let bytes = self
            .reader
            .read_line(&mut self.line)
            .await
            .context("failed to read from event stream")?;
        if bytes == 0 {
            return Ok(None);
        }
        let event = serde_json::from_str(self.line.trim_end())
            .context("failed to decode daemon event")?;
        Ok(Some(event))
    }
}

pub async fn watch(daemon_addr: &str, name: Option<String>) -> Result<EventStream> {
    let mut stream = TcpStream::connect(daemon_addr)
        .await
        .with_context(|| format!("failed to connect to daemon at {daemon_addr}"))?;
    write_json_line(&mut stream, &IpcRequest::Watch { name }).await?;

    let mut events = EventStream {
        reader: BufReader::new(stream),
        line: String::new(),
    };
    let bytes = events
        .reader
        .read_line(&mut events.line)
        .await
        .context("failed to read from IPC stream")?;
    if bytes == 0 {
        anyhow::bail!("daemon closed IPC connection unexpectedly");
    }
    let reply: IpcResponse = serde_json::from_str(events.line.trim_end())
        .context("failed to decode daemon response/request payload")?;
    if !reply.ok {
        anyhow::bail!(reply.message);
    }
    Ok(events)
}

pub async fn read_json_line<T, S>(stream: &mut S) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read from IPC stream")?;

    if bytes == 0 {
        anyhow::bail!("daemon closed IPC connection unexpectedly");
    }

    serde_json::from_str::<T>(line.trim_end())
        .context("failed to decode daemon response/request payload")
}

pub async fn write_json_line<T, S>(stream: &mut S, value: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .await
        .context("failed to write IPC payload")?;
    stream
        .flush()
        .await
        .context("failed to flush IPC payload")?;
    Ok(())
}
