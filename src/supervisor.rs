use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::errors::HerdError;
use crate::logging::{LogSink, SinkMessage};
use crate::ports::detect_port;
#[cfg(target_os = "linux")]
use crate::ports::listening_ports;
use crate::registry::RegistryCommand;
use crate::server::{
    now_epoch_millis, now_epoch_secs, ChildExit, HerdEvent, LogStream, ProcessRuntime,
    ServerConfig, ServerState, StatusChange,
};

/// Longest output line kept in one piece. Longer runs are split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Runtime snapshot shared with readers. Only actors write to it.
pub type RuntimeTable = Arc<RwLock<HashMap<String, ProcessRuntime>>>;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub stop_grace: Duration,
    /// How long to wait for the exit after a forced kill.
    pub kill_wait: Duration,
    /// Spacing and count of socket scans looking for the port of a new child.
    pub port_scan_interval: Duration,
    pub port_scan_attempts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            port_scan_interval: Duration::from_secs(1),
            port_scan_attempts: 30,
        }
    }
}

/// Everything an actor needs besides its own config.
#[derive(Clone)]
pub struct ActorContext {
    pub table: RuntimeTable,
    pub events: broadcast::Sender<HerdEvent>,
    pub sink: LogSink,
    pub registry: mpsc::UnboundedSender<RegistryCommand>,
    pub settings: SupervisorSettings,
}

pub enum ActorCommand {
    Start {
        reply: oneshot::Sender<Result<ProcessRuntime>>,
    },
    Stop {
        reply: oneshot::Sender<Result<ProcessRuntime>>,
    },
    Restart {
        reply: oneshot::Sender<Result<ProcessRuntime>>,
    },
    Reconfigure {
        config: ServerConfig,
        reply: oneshot::Sender<Result<ServerConfig>>,
    },
    Retire {
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
enum ChildEvent {
    Exited(ChildExit),
    Port { pid: u32, port: u16 },
    LinesDropped { pid: u32, count: u64 },
}

/// Cheap address of one server's actor.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    name: String,
    tx: mpsc::UnboundedSender<ActorCommand>,
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn start(&self) -> Result<ProcessRuntime> {
        self.request(|reply| ActorCommand::Start { reply }).await
    }

    pub async fn stop(&self) -> Result<ProcessRuntime> {
        self.request(|reply| ActorCommand::Stop { reply }).await
    }

    pub async fn restart(&self) -> Result<ProcessRuntime> {
        self.request(|reply| ActorCommand::Restart { reply }).await
    }

    pub async fn reconfigure(&self, config: ServerConfig) -> Result<ServerConfig> {
        self.request(|reply| ActorCommand::Reconfigure { config, reply })
            .await
    }

    pub async fn retire(&self, force: bool) -> Result<()> {
        self.request(|reply| ActorCommand::Retire { force, reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ActorCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| HerdError::NotFound(self.name.clone()))?;
        reply_rx
            .await
            .map_err(|_| HerdError::NotFound(self.name.clone()))?
    }
}

pub fn spawn_actor(config: ServerConfig, ctx: ActorContext) -> ServerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (child_tx, child_rx) = mpsc::unbounded_channel();
    let handle = ServerHandle {
        name: config.name.clone(),
        tx,
    };
    let actor = ServerActor {
        config,
        runtime: ProcessRuntime::default(),
        child: None,
        ctx,
        child_tx,
        child_rx,
    };
    tokio::spawn(actor.run(rx));
    handle
}

struct RunningChild {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct ServerActor {
    config: ServerConfig,
    runtime: ProcessRuntime,
    child: Option<RunningChild>,
    ctx: ActorContext,
    child_tx: mpsc::UnboundedSender<ChildEvent>,
    child_rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ServerActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ActorCommand>) {
        self.publish().await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if self.handle_command(command).await {
                        return;
                    }
                }
                Some(event) = self.child_rx.recv() => {
                    self.handle_child_event(event).await;
                }
            }
        }

        if let Some(mut child) = self.child.take() {
            warn!("supervisor for {} closed with a live child; killing pid {}", self.config.name, child.pid);
            force_kill(&mut child);
        }
    }

    /// Returns true once the actor has retired.
    async fn handle_command(&mut self, command: ActorCommand) -> bool {
        match command {
            ActorCommand::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            ActorCommand::Stop { reply } => {
                let result = self.stop().await.map(|_| self.runtime.clone());
                let _ = reply.send(result);
            }
            ActorCommand::Restart { reply } => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            ActorCommand::Reconfigure { config, reply } => {
                let result = self.reconfigure(config).await;
                let _ = reply.send(result);
            }
            ActorCommand::Retire { force, reply } => {
                if self.runtime.state.is_active() && !force {
                    let _ = reply.send(Err(self.in_use()));
                    return false;
                }
                if let Err(err) = self.stop().await {
                    let _ = reply.send(Err(err));
                    return false;
                }
                self.ctx.table.write().await.remove(&self.config.name);
                debug!("supervisor for {} retired", self.config.name);
                let _ = reply.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn start(&mut self) -> Result<ProcessRuntime> {
        self.drain_child_events().await;
        if matches!(
            self.runtime.state,
            ServerState::Starting | ServerState::Running
        ) {
            return Err(HerdError::AlreadyRunning(self.config.name.clone()).into());
        }
        if self.runtime.state == ServerState::Stopping {
            return Err(self.in_use());
        }

        self.runtime.last_error = None;
        self.runtime.last_exit_code = None;
        self.runtime.detected_port = None;
        self.transition(ServerState::Starting).await;

        match self.spawn_child() {
            Ok((pid, child)) => {
                self.watch_child(pid, child);
                self.runtime.pid = Some(pid);
                self.runtime.started_at = Some(now_epoch_secs());
                self.transition(ServerState::Running).await;
                info!(
                    "started {} (pid {pid}): {}",
                    self.config.name,
                    self.config.command_line()
                );
                Ok(self.runtime.clone())
            }
            Err(err) => {
                let detail = format!("{err:#}");
                error!("failed to start {}: {detail}", self.config.name);
                self.runtime.pid = None;
                self.runtime.last_error = Some(detail);
                self.transition(ServerState::Crashed).await;
                Err(err)
            }
        }
    }

    fn spawn_child(&self) -> Result<(u32, Child)> {
        let mut command = Command::new(&self.config.command);
        #[cfg(unix)]
        {
            // Own process group so stop can signal the whole tree.
            unsafe {
                command.pre_exec(|| {
                    if nix::libc::setpgid(0, 0) == 0 {
                        Ok(())
                    } else {
                        Err(std::io::Error::last_os_error())
                    }
                });
            }
        }
        command
            .args(self.config.launch_args())
            .current_dir(self.config.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.command))?;
        let pid = child.id().context("spawned child has no pid")?;
        Ok((pid, child))
    }

    fn watch_child(&mut self, pid: u32, mut child: Child) {
        let log_tx = self.ctx.sink.channel_for(&self.config.name);
        if let Some(stdout) = child.stdout.take() {
            self.spawn_capture(stdout, LogStream::Stdout, pid, log_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_capture(stderr, LogStream::Stderr, pid, log_tx);
        }

        #[cfg(target_os = "linux")]
        if self.config.port.is_none() {
            self.spawn_port_scan(pid);
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exit_tx = self.child_tx.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let event = match status {
                Ok(status) => ChildExit {
                    pid,
                    exit_code: status.code(),
                    signal: exit_signal(&status),
                    wait_error: false,
                },
                Err(err) => {
                    error!("child wait failed: {err}");
                    ChildExit {
                        pid,
                        exit_code: None,
                        signal: None,
                        wait_error: true,
                    }
                }
            };
            let _ = exit_tx.send(ChildEvent::Exited(event));
        });

        self.child = Some(RunningChild {
            pid,
            kill_tx: Some(kill_tx),
        });
    }

    fn spawn_capture<R>(
        &self,
        reader: R,
        stream: LogStream,
        pid: u32,
        log_tx: mpsc::Sender<SinkMessage>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = self.config.name.clone();
        let sink = self.ctx.sink.clone();
        let events = self.child_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buffer = Vec::with_capacity(1024);
            let mut dropped = 0_u64;
            let mut port_seen = false;

            loop {
                buffer.clear();
                match read_capped_line(&mut reader, &mut buffer, MAX_LINE_BYTES).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!("{stream} capture for {name} ended: {err}");
                        break;
                    }
                }
                if buffer.last() != Some(&b'\n') && buffer.len() >= MAX_LINE_BYTES {
                    debug!("{stream} line of {name} exceeds {MAX_LINE_BYTES} bytes; splitting");
                }

                let text = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if !port_seen {
                    if let Some(port) = detect_port(&text) {
                        port_seen = true;
                        let _ = events.send(ChildEvent::Port { pid, port });
                    }
                }

                let line = sink.line(&name, stream, text);
                match log_tx.try_send(SinkMessage::Line(line)) {
                    Ok(()) => {
                        if dropped > 0 {
                            let _ = events.send(ChildEvent::LinesDropped {
                                pid,
                                count: dropped,
                            });
                            dropped = 0;
                        }
                    }
                    Err(TrySendError::Full(_)) => dropped += 1,
                    Err(TrySendError::Closed(_)) => break,
                }
            }

            if dropped > 0 {
                let _ = events.send(ChildEvent::LinesDropped {
                    pid,
                    count: dropped,
                });
            }
        });
    }

    /// Polls the sockets of the child's process tree until one listens.
    #[cfg(target_os = "linux")]
    fn spawn_port_scan(&self, pid: u32) {
        let events = self.child_tx.clone();
        let interval = self.ctx.settings.port_scan_interval;
        let attempts = self.ctx.settings.port_scan_attempts;
        tokio::spawn(async move {
            let mut system = sysinfo::System::new();
            for _ in 0..attempts {
                tokio::time::sleep(interval).await;
                let scan = tokio::task::spawn_blocking(move || {
                    let ports = listening_ports(&mut system, pid);
                    (system, ports)
                })
                .await;
                let Ok((returned, ports)) = scan else {
                    return;
                };
                system = returned;
                match ports {
                    None => return,
                    Some(ports) => {
                        if let Some(port) = ports.first().copied() {
                            let _ = events.send(ChildEvent::Port { pid, port });
                            return;
                        }
                    }
                }
            }
            debug!("no listening socket found for pid {pid}");
        });
    }

    async fn stop(&mut self) -> Result<()> {
        self.drain_child_events().await;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.pid;

        self.transition(ServerState::Stopping).await;
        let grace = self.ctx.settings.stop_grace;
        info!("stopping {} (pid {pid}), grace {:?}", self.config.name, grace);
        send_terminate(&mut child);

        let mut exit = self.wait_for_exit(pid, Instant::now() + grace).await;
        if exit.is_none() {
            warn!(
                "{} did not exit within {:?}; sending SIGKILL",
                self.config.name, grace
            );
            force_kill(&mut child);
            exit = self
                .wait_for_exit(pid, Instant::now() + self.ctx.settings.kill_wait)
                .await;
            if exit.is_none() {
                // Keep the child so its late exit still completes the stop.
                let detail = format!("pid {pid} did not exit after SIGKILL");
                error!("{}: {detail}", self.config.name);
                self.runtime.last_error = Some(detail.clone());
                self.child = Some(child);
                self.publish().await;
                anyhow::bail!("{} is still stopping: {detail}", self.config.name);
            }
        }

        self.runtime.last_exit_code = exit.and_then(|exit| exit.exit_code);
        self.runtime.pid = None;
        self.runtime.detected_port = None;
        self.transition(ServerState::Stopped).await;
        Ok(())
    }

    async fn restart(&mut self) -> Result<ProcessRuntime> {
        self.stop().await?;
        self.runtime.restart_count = self.runtime.restart_count.saturating_add(1);
        self.start().await
    }

    async fn reconfigure(&mut self, mut config: ServerConfig) -> Result<ServerConfig> {
        self.drain_child_events().await;
        if self.runtime.state.is_active() {
            return Err(self.in_use());
        }
        if config.command.trim().is_empty() {
            return Err(HerdError::InvalidCommand("command cannot be empty".to_string()).into());
        }

        config.name = self.config.name.clone();
        config.created_at = self.config.created_at;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.ctx
            .registry
            .send(RegistryCommand::Commit {
                config: config.clone(),
                reply: reply_tx,
            })
            .map_err(|_| HerdError::Unavailable("registry"))?;
        reply_rx
            .await
            .map_err(|_| HerdError::Unavailable("registry"))??;

        info!("updated configuration for {}", self.config.name);
        self.config = config.clone();
        Ok(config)
    }

    /// Applies child events that are already queued without waiting.
    async fn drain_child_events(&mut self) {
        while let Ok(event) = self.child_rx.try_recv() {
            self.handle_child_event(event).await;
        }
    }

    /// Waits for the exit of `pid`, applying unrelated child events meanwhile.
    async fn wait_for_exit(&mut self, pid: u32, deadline: Instant) -> Option<ChildExit> {
        loop {
            match timeout_at(deadline, self.child_rx.recv()).await {
                Ok(Some(ChildEvent::Exited(exit))) if exit.pid == pid => return Some(exit),
                Ok(Some(event)) => self.handle_child_event(event).await,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    async fn handle_child_event(&mut self, event: ChildEvent) {
        let current = self.child.as_ref().map(|child| child.pid);
        match event {
            ChildEvent::Exited(exit) if Some(exit.pid) == current => {
                self.child = None;
                self.runtime.pid = None;
                self.runtime.detected_port = None;
                self.runtime.last_exit_code = exit.exit_code;
                if self.runtime.state == ServerState::Stopping {
                    info!("{} (pid {}) {} after a stalled stop", self.config.name, exit.pid, exit.describe());
                    self.runtime.last_error = None;
                    self.transition(ServerState::Stopped).await;
                } else {
                    self.runtime.last_error = Some(exit.describe());
                    warn!("{} {} unexpectedly", self.config.name, exit.describe());
                    self.transition(ServerState::Crashed).await;
                }
            }
            ChildEvent::Exited(exit) => {
                debug!("ignoring stale exit of pid {} for {}", exit.pid, self.config.name);
            }
            ChildEvent::Port { pid, port } if Some(pid) == current => {
                if self.runtime.detected_port.is_none() {
                    info!("{} is listening on port {port}", self.config.name);
                    self.runtime.detected_port = Some(port);
                    self.publish().await;
                }
            }
            ChildEvent::LinesDropped { pid, count } => {
                debug!("dropped {count} output lines of pid {pid} for {}", self.config.name);
                self.runtime.dropped_lines = self.runtime.dropped_lines.saturating_add(count);
                self.publish().await;
            }
            ChildEvent::Port { .. } => {}
        }
    }

    async fn transition(&mut self, to: ServerState) {
        let from = self.runtime.state;
        self.runtime.state = to;
        self.publish().await;
        if from == to {
            return;
        }

        debug!("{}: {from} -> {to}", self.config.name);
        let _ = self.ctx.events.send(HerdEvent::Status(StatusChange {
            name: self.config.name.clone(),
            from,
            to,
            at_ms: now_epoch_millis(),
        }));
    }

    async fn publish(&self) {
        self.ctx
            .table
            .write()
            .await
            .insert(self.config.name.clone(), self.runtime.clone());
    }

    fn in_use(&self) -> anyhow::Error {
        HerdError::InUse {
            name: self.config.name.clone(),
            state: self.runtime.state,
        }
        .into()
    }
}

/// Like `read_until(b'\n')`, but stops once `buffer` holds `limit` bytes.
async fn read_capped_line<R>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<usize>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut read = 0;
    while buffer.len() < limit {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let window = &available[..available.len().min(limit - buffer.len())];
        let (used, complete) = match window.iter().position(|byte| *byte == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (window.len(), false),
        };
        buffer.extend_from_slice(&window[..used]);
        reader.consume(used);
        read += used;
        if complete {
            break;
        }
    }
    Ok(read)
}

#[cfg(unix)]
fn send_terminate(child: &mut RunningChild) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(-(child.pid as i32));
    match kill(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            let _ = kill(Pid::from_raw(child.pid as i32), Signal::SIGTERM);
        }
        Err(err) => {
            warn!("failed to send SIGTERM to process group {pgid}: {err}");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut RunningChild) {
    if let Some(kill_tx) = child.kill_tx.take() {
        let _ = kill_tx.send(());
    }
}

fn force_kill(child: &mut RunningChild) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(-(child.pid as i32)), Signal::SIGKILL);
    }
    if let Some(kill_tx) = child.kill_tx.take() {
        let _ = kill_tx.send(());
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use tokio::io::BufReader;
    use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
    use tokio::time::{sleep, Instant};

    use super::{
        read_capped_line, spawn_actor, ActorCommand, ActorContext, ChildEvent, RunningChild,
        RuntimeTable, ServerActor, ServerHandle, SupervisorSettings, MAX_LINE_BYTES,
    };
    use crate::errors::HerdError;
    use crate::logging::{LogRetentionPolicy, LogSink, SeverityRules};
    use crate::registry::RegistryCommand;
    use crate::server::{ChildExit, HerdEvent, ProcessRuntime, ServerConfig, ServerState};

    struct Fixture {
        dir: PathBuf,
        table: RuntimeTable,
        events: broadcast::Sender<HerdEvent>,
        sink: LogSink,
        registry_rx: mpsc::UnboundedReceiver<RegistryCommand>,
        ctx: ActorContext,
    }

    fn fixture(prefix: &str, stop_grace: Duration) -> Fixture {
        let dir = temp_dir(prefix);
        fs::create_dir_all(&dir).expect("failed to create fixture dir");
        let table: RuntimeTable = Arc::new(RwLock::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let sink = LogSink::new(
            dir.join("logs"),
            LogRetentionPolicy {
                max_bytes: 1024 * 1024,
                max_lines: 1000,
                live_lines: 100,
            },
            SeverityRules::default(),
            64,
            events.clone(),
        );
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let ctx = ActorContext {
            table: table.clone(),
            events: events.clone(),
            sink: sink.clone(),
            registry: registry_tx,
            settings: SupervisorSettings {
                stop_grace,
                kill_wait: Duration::from_secs(5),
                port_scan_interval: Duration::from_millis(100),
                ..SupervisorSettings::default()
            },
        };
        Fixture {
            dir,
            table,
            events,
            sink,
            registry_rx,
            ctx,
        }
    }

    fn shell_server(fx: &Fixture, name: &str, script: &str) -> ServerHandle {
        let config = ServerConfig::new(
            name,
            &fx.dir,
            "sh",
            vec!["-c".to_string(), script.to_string()],
            None,
        );
        spawn_actor(config, fx.ctx.clone())
    }

    async fn state_of(table: &RuntimeTable, name: &str) -> Option<ServerState> {
        table.read().await.get(name).map(|runtime| runtime.state)
    }

    async fn wait_for_state(table: &RuntimeTable, name: &str, wanted: ServerState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if state_of(table, name).await == Some(wanted) {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_then_stop_reaches_running_and_stopped() {
        let fx = fixture("sup-start-stop", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "echo 'listening on port 4321'; sleep 30");

        let runtime = handle.start().await.expect("start should succeed");
        assert_eq!(runtime.state, ServerState::Running);
        assert!(runtime.pid.is_some());
        assert!(runtime.started_at.is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let detected = fx
                .table
                .read()
                .await
                .get("api")
                .and_then(|runtime| runtime.detected_port);
            if detected == Some(4321) || Instant::now() > deadline {
                assert_eq!(detected, Some(4321));
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }

        let runtime = handle.stop().await.expect("stop should succeed");
        assert_eq!(runtime.state, ServerState::Stopped);
        assert_eq!(runtime.pid, None);
        assert_eq!(runtime.detected_port, None);

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_start_is_rejected_without_changing_state() {
        let fx = fixture("sup-double-start", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");

        let first = handle.start().await.expect("first start should succeed");
        let err = handle.start().await.expect_err("second start must fail");
        assert!(matches!(
            err.downcast_ref::<HerdError>(),
            Some(HerdError::AlreadyRunning(_))
        ));

        let current = fx.table.read().await.get("api").cloned().expect("runtime");
        assert_eq!(current.pid, first.pid);
        assert_eq!(current.state, ServerState::Running);

        handle.stop().await.expect("stop should succeed");
        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_starts_produce_one_process() {
        let fx = fixture("sup-concurrent", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.start().await }));
        }
        let mut ok = 0;
        for task in tasks {
            if task.await.expect("start task panicked").is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1, "exactly one start should win");

        handle.stop().await.expect("stop should succeed");
        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_on_stopped_server_emits_no_event() {
        let fx = fixture("sup-stop-noop", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");
        let mut events = fx.events.subscribe();

        let runtime = handle.stop().await.expect("stop should be a no-op");
        assert_eq!(runtime.state, ServerState::Stopped);
        sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err(), "no status event expected");

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsolicited_exit_is_recorded_as_crash_with_exit_code() {
        let fx = fixture("sup-crash", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "echo boom >&2; exit 3");

        handle.start().await.expect("start should succeed");
        assert!(wait_for_state(&fx.table, "api", ServerState::Crashed).await);

        let runtime = fx.table.read().await.get("api").cloned().expect("runtime");
        assert_eq!(runtime.last_exit_code, Some(3));
        assert_eq!(runtime.pid, None);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            fx.sink.sync("api").await;
            let lines = fx.sink.read_lines("api", 10).expect("logs readable");
            if lines.iter().any(|line| line.text == "boom") {
                break;
            }
            assert!(Instant::now() < deadline, "stderr line was never captured");
            sleep(Duration::from_millis(25)).await;
        }

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_failure_marks_crashed_with_detail() {
        let fx = fixture("sup-spawn-fail", Duration::from_secs(5));
        let config = ServerConfig::new(
            "ghost",
            &fx.dir,
            "nodeherd-definitely-missing-binary",
            Vec::new(),
            None,
        );
        let handle = spawn_actor(config, fx.ctx.clone());

        assert!(handle.start().await.is_err());
        let runtime = fx.table.read().await.get("ghost").cloned().expect("runtime");
        assert_eq!(runtime.state, ServerState::Crashed);
        assert_eq!(runtime.pid, None);
        assert!(runtime
            .last_error
            .as_deref()
            .is_some_and(|detail| !detail.is_empty()));

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hung_process_is_killed_after_grace_period() {
        let fx = fixture("sup-hung", Duration::from_millis(500));
        let handle = shell_server(&fx, "api", "trap '' TERM; sleep 30");

        handle.start().await.expect("start should succeed");
        sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let runtime = handle.stop().await.expect("stop should succeed");
        assert_eq!(runtime.state, ServerState::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(10));

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_replaces_the_process_and_counts() {
        let fx = fixture("sup-restart", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");

        let first = handle.start().await.expect("start should succeed");
        let second = handle.restart().await.expect("restart should succeed");
        assert_eq!(second.state, ServerState::Running);
        assert_ne!(first.pid, second.pid);
        assert_eq!(second.restart_count, 1);

        handle.stop().await.expect("stop should succeed");
        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconfigure_is_rejected_while_running_and_committed_when_resting() {
        let fx = fixture("sup-reconfigure", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");
        handle.start().await.expect("start should succeed");

        let replacement = ServerConfig::new("renamed", &fx.dir, "node", Vec::new(), Some(3000));
        let err = handle
            .reconfigure(replacement.clone())
            .await
            .expect_err("running server must reject edits");
        assert!(matches!(
            err.downcast_ref::<HerdError>(),
            Some(HerdError::InUse { .. })
        ));

        handle.stop().await.expect("stop should succeed");

        let mut registry_rx = fx.registry_rx;
        let registry = tokio::spawn(async move {
            if let Some(RegistryCommand::Commit { config, reply }) = registry_rx.recv().await {
                let _ = reply.send(Ok(()));
                return Some(config);
            }
            None
        });
        let updated = handle
            .reconfigure(replacement)
            .await
            .expect("resting server accepts edits");
        assert_eq!(updated.name, "api");
        assert_eq!(updated.port, Some(3000));
        let committed = registry.await.expect("registry task panicked");
        assert_eq!(committed.map(|config| config.name), Some("api".to_string()));

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retire_requires_force_while_running() {
        let fx = fixture("sup-retire", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");
        handle.start().await.expect("start should succeed");

        assert!(handle.retire(false).await.is_err());
        handle.retire(true).await.expect("forced retire succeeds");
        assert!(fx.table.read().await.get("api").is_none());

        let err = handle.start().await.expect_err("retired actor is gone");
        assert!(matches!(
            err.downcast_ref::<HerdError>(),
            Some(HerdError::NotFound(_))
        ));

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_queued_behind_start_leaves_no_process_behind() {
        let fx = fixture("sup-start-stop-queued", Duration::from_secs(5));
        let handle = shell_server(&fx, "api", "sleep 30");

        let (start_tx, start_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        handle
            .tx
            .send(ActorCommand::Start { reply: start_tx })
            .expect("actor accepts start");
        handle
            .tx
            .send(ActorCommand::Stop { reply: stop_tx })
            .expect("actor accepts stop");

        let started = start_rx
            .await
            .expect("start reply")
            .expect("start should succeed");
        let pid = started.pid.expect("started server has a pid");
        let stopped = stop_rx
            .await
            .expect("stop reply")
            .expect("stop should succeed");
        assert_eq!(stopped.state, ServerState::Stopped);
        assert_eq!(stopped.pid, None);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(state_of(&fx.table, "api").await, Some(ServerState::Stopped));
        assert!(
            kill(Pid::from_raw(pid as i32), None).is_err(),
            "pid {pid} outlived the stop"
        );

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nonzero_exit_after_terminate_is_a_stop_with_its_code() {
        let fx = fixture("sup-term-exit-code", Duration::from_secs(5));
        let handle = shell_server(
            &fx,
            "api",
            "trap 'exit 3' TERM; while true; do sleep 0.1; done",
        );

        handle.start().await.expect("start should succeed");
        sleep(Duration::from_millis(300)).await;

        let runtime = handle.stop().await.expect("stop should succeed");
        assert_eq!(runtime.state, ServerState::Stopped);
        assert_eq!(runtime.last_exit_code, Some(3));
        assert_eq!(runtime.last_error, None);

        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unseen_exit_after_kill_keeps_server_stopping() {
        use std::os::unix::process::CommandExt;

        let mut fx = fixture("sup-kill-unseen", Duration::from_millis(100));
        fx.ctx.settings.kill_wait = Duration::from_millis(100);

        // Nothing waits on this child, so the actor never hears about its exit.
        let mut orphan = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("failed to spawn sleep");
        let pid = orphan.id();

        let (child_tx, child_rx) = mpsc::unbounded_channel();
        let mut actor = ServerActor {
            config: ServerConfig::new("api", &fx.dir, "sh", Vec::new(), None),
            runtime: ProcessRuntime {
                state: ServerState::Running,
                pid: Some(pid),
                ..ProcessRuntime::default()
            },
            child: Some(RunningChild { pid, kill_tx: None }),
            ctx: fx.ctx.clone(),
            child_tx,
            child_rx,
        };

        let err = actor.stop().await.expect_err("stop without an exit must fail");
        assert!(err.to_string().contains("still stopping"), "{err:#}");
        assert_eq!(actor.runtime.state, ServerState::Stopping);
        assert_eq!(actor.runtime.pid, Some(pid));
        assert!(actor
            .runtime
            .last_error
            .as_deref()
            .is_some_and(|detail| detail.contains("SIGKILL")));

        let err = actor.start().await.expect_err("start must wait for the exit");
        assert!(matches!(
            err.downcast_ref::<HerdError>(),
            Some(HerdError::InUse { .. })
        ));

        actor
            .child_tx
            .send(ChildEvent::Exited(ChildExit {
                pid,
                exit_code: None,
                signal: Some(9),
                wait_error: false,
            }))
            .expect("child channel open");
        actor.drain_child_events().await;
        assert_eq!(actor.runtime.state, ServerState::Stopped);
        assert_eq!(actor.runtime.pid, None);
        assert_eq!(actor.runtime.last_error, None);
        assert_eq!(state_of(&fx.table, "api").await, Some(ServerState::Stopped));

        let _ = orphan.wait();
        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn long_output_without_newline_is_split_into_bounded_lines() {
        let fx = fixture("sup-long-line", Duration::from_secs(5));
        let total = MAX_LINE_BYTES * 3 + 100;
        let handle = shell_server(
            &fx,
            "api",
            &format!("head -c {total} /dev/zero | tr '\\0' x; echo; echo done; sleep 30"),
        );

        handle.start().await.expect("start should succeed");
        let deadline = Instant::now() + Duration::from_secs(10);
        let lines = loop {
            fx.sink.sync("api").await;
            let lines = fx.sink.read_lines("api", 100).expect("logs readable");
            if lines.iter().any(|line| line.text == "done") {
                break lines;
            }
            assert!(Instant::now() < deadline, "output was never captured");
            sleep(Duration::from_millis(50)).await;
        };

        let chunks: Vec<usize> = lines
            .iter()
            .filter(|line| line.text.starts_with('x'))
            .map(|line| line.text.len())
            .collect();
        assert_eq!(chunks.len(), 4, "unexpected chunks {chunks:?}");
        assert!(chunks.iter().all(|len| *len <= MAX_LINE_BYTES));
        assert_eq!(chunks.iter().sum::<usize>(), total);

        handle.stop().await.expect("stop should succeed");
        let _ = fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn capped_reader_splits_at_limit_and_keeps_newlines() {
        let input: &[u8] = b"abcdefgh\nij\n";
        let mut reader = BufReader::new(input);
        let mut buffer = Vec::new();

        assert_eq!(read_capped_line(&mut reader, &mut buffer, 5).await.expect("read"), 5);
        assert_eq!(buffer, b"abcde");
        buffer.clear();
        assert_eq!(read_capped_line(&mut reader, &mut buffer, 5).await.expect("read"), 4);
        assert_eq!(buffer, b"fgh\n");
        buffer.clear();
        assert_eq!(read_capped_line(&mut reader, &mut buffer, 5).await.expect("read"), 3);
        assert_eq!(buffer, b"ij\n");
        buffer.clear();
        assert_eq!(read_capped_line(&mut reader, &mut buffer, 5).await.expect("read"), 0);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("nodeherd-{prefix}-{nonce}"))
    }
}
