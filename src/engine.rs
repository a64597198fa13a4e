use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::HerdError;
use crate::logging::{LogSink, SeverityRules};
use crate::metrics::{spawn_sampler, MetricsHandle};
use crate::registry::{spawn_registry, RegistryHandle};
use crate::server::{
    HerdEvent, LogLine, MetricSample, ProcessRuntime, ServerConfig, ServerState, ServerView, Stack,
};
use crate::storage::load_configs;
use crate::supervisor::{RuntimeTable, ServerHandle};

const EVENT_CAPACITY: usize = 1024;

/// Result of one member of a stack operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackOutcome {
    pub server: String,
    pub ok: bool,
    #[serde(default)]
    pub state: Option<ServerState>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Entry point to the supervision engine. Cheap to clone.
#[derive(Clone)]
pub struct Herd {
    registry: RegistryHandle,
    table: RuntimeTable,
    sink: LogSink,
    metrics: MetricsHandle,
    events: broadcast::Sender<HerdEvent>,
}

impl Herd {
    /// Loads persisted configs and starts the registry, sampler and one actor per server.
    ///
    /// Must be called inside a tokio runtime. Servers come up in the Stopped state.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        Self::open_with_rules(config, SeverityRules::default()).await
    }

    pub async fn open_with_rules(config: &AppConfig, rules: SeverityRules) -> Result<Self> {
        config.ensure_layout()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let table: RuntimeTable = Arc::new(RwLock::new(HashMap::new()));

        let sink = LogSink::new(
            config.log_dir.clone(),
            config.log_retention,
            rules,
            config.log_buffer,
            events.clone(),
        );
        let persisted = load_configs(&config.config_path);
        let registry = spawn_registry(
            config.config_path.clone(),
            persisted,
            table.clone(),
            events.clone(),
            sink.clone(),
            config.supervisor,
        );
        let metrics = spawn_sampler(
            config.sampler,
            config.metrics_dir.clone(),
            table.clone(),
            events.clone(),
        );

        Ok(Self {
            registry,
            table,
            sink,
            metrics,
            events,
        })
    }

    pub async fn add_server(&self, config: ServerConfig) -> Result<ServerView> {
        let name = config.name.clone();
        self.registry.add(config).await?;
        self.status(&name).await
    }

    /// Deletes the server with its logs and metrics. Running servers need `force`.
    pub async fn remove_server(&self, name: &str, force: bool) -> Result<()> {
        let handle = self.registry.lookup(name).await?;
        handle.retire(force).await?;
        self.registry.forget(name).await?;
        self.sink.delete(name).await;
        if let Err(err) = self.metrics.forget(name).await {
            warn!("failed to drop metrics for {name}: {err:#}");
        }
        Ok(())
    }

    /// Replaces the config of a resting server. Its name and creation time are kept.
    pub async fn update_server(&self, name: &str, config: ServerConfig) -> Result<ServerView> {
        let handle = self.registry.lookup(name).await?;
        handle.reconfigure(config).await?;
        self.status(name).await
    }

    pub async fn start(&self, name: &str) -> Result<ServerView> {
        let handle = self.registry.lookup(name).await?;
        handle.start().await?;
        self.status(name).await
    }

    pub async fn stop(&self, name: &str) -> Result<ServerView> {
        let handle = self.registry.lookup(name).await?;
        handle.stop().await?;
        self.status(name).await
    }

    pub async fn restart(&self, name: &str) -> Result<ServerView> {
        let handle = self.registry.lookup(name).await?;
        handle.restart().await?;
        self.status(name).await
    }

    pub async fn status(&self, name: &str) -> Result<ServerView> {
        let config = self.registry.get(name).await?;
        let runtime = self.runtime_of(name).await;
        Ok(ServerView { config, runtime })
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerView>> {
        let configs = self.registry.list().await?;
        let table = self.table.read().await;
        Ok(configs
            .into_iter()
            .map(|config| {
                let runtime = table.get(&config.name).cloned().unwrap_or_default();
                ServerView { config, runtime }
            })
            .collect())
    }

    /// Newest persisted log lines for `name`, oldest first.
    pub async fn logs(&self, name: &str, max: usize) -> Result<Vec<LogLine>> {
        self.registry.get(name).await?;
        self.sink.sync(name).await;
        self.sink.read_lines(name, max)
    }

    pub fn live_logs(&self, name: &str, max: usize) -> Vec<LogLine> {
        self.sink.live_tail(name, max)
    }

    pub fn live_metrics(&self, name: &str, max: usize) -> Vec<MetricSample> {
        self.metrics.live(name, max)
    }

    pub async fn metrics_history(
        &self,
        name: &str,
        since_ms: Option<u64>,
    ) -> Result<Vec<MetricSample>> {
        self.registry.get(name).await?;
        self.metrics.history(name, since_ms)
    }

    pub async fn clear_logs(&self, name: &str) -> Result<()> {
        self.registry.get(name).await?;
        self.sink.clear(name).await;
        Ok(())
    }

    pub async fn add_stack(&self, name: &str, servers: Vec<String>) -> Result<Stack> {
        self.registry
            .add_stack(Stack {
                name: name.to_string(),
                servers,
            })
            .await
    }

    pub async fn update_stack(&self, name: &str, servers: Vec<String>) -> Result<Stack> {
        self.registry
            .update_stack(Stack {
                name: name.to_string(),
                servers,
            })
            .await
    }

    pub async fn remove_stack(&self, name: &str) -> Result<()> {
        self.registry.remove_stack(name).await
    }

    pub async fn list_stacks(&self) -> Result<Vec<Stack>> {
        self.registry.list_stacks().await
    }

    /// Starts every member concurrently. Members already running count as successes.
    pub async fn start_stack(&self, name: &str) -> Result<Vec<StackOutcome>> {
        let members = self.registry.stack_members(name).await?;
        info!("starting stack {name} ({} member(s))", members.len());
        Ok(self.fan_out(members, StackAction::Start).await)
    }

    pub async fn stop_stack(&self, name: &str) -> Result<Vec<StackOutcome>> {
        let members = self.registry.stack_members(name).await?;
        info!("stopping stack {name} ({} member(s))", members.len());
        Ok(self.fan_out(members, StackAction::Stop).await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HerdEvent> {
        self.events.subscribe()
    }

    /// Stops every process, then flushes metrics, logs and configs.
    pub async fn shutdown(&self) -> Result<()> {
        let handles = self.registry.handles().await?;
        let mut stops = JoinSet::new();
        for handle in handles {
            stops.spawn(async move {
                let name = handle.name().to_string();
                (name, handle.stop().await)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((name, Err(err))) => warn!("failed to stop {name} during shutdown: {err:#}"),
                Ok(_) => {}
                Err(err) => warn!("stop task failed during shutdown: {err}"),
            }
        }

        if let Err(err) = self.metrics.shutdown().await {
            warn!("failed to flush metrics during shutdown: {err:#}");
        }
        self.sink.sync_all().await;
        self.registry.save().await?;
        info!("all servers stopped");
        Ok(())
    }

    async fn runtime_of(&self, name: &str) -> ProcessRuntime {
        self.table
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    async fn fan_out(&self, members: Vec<ServerHandle>, action: StackAction) -> Vec<StackOutcome> {
        let order: Vec<String> = members
            .iter()
            .map(|handle| handle.name().to_string())
            .collect();
        let mut tasks = JoinSet::new();
        for handle in members {
            tasks.spawn(async move {
                let result = match action {
                    StackAction::Start => handle.start().await,
                    StackAction::Stop => handle.stop().await,
                };
                (handle.name().to_string(), result)
            });
        }

        let mut outcomes: HashMap<String, StackOutcome> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((server, result)) = joined else {
                continue;
            };
            let outcome = match result {
                Ok(runtime) => StackOutcome {
                    server: server.clone(),
                    ok: true,
                    state: Some(runtime.state),
                    error: None,
                },
                Err(err) => {
                    let already_running =
                        matches!(err.downcast_ref::<HerdError>(), Some(HerdError::AlreadyRunning(_)));
                    StackOutcome {
                        server: server.clone(),
                        ok: already_running,
                        state: Some(self.runtime_of(&server).await.state),
                        error: (!already_running).then(|| format!("{err:#}")),
                    }
                }
            };
            outcomes.insert(server, outcome);
        }

        order
            .into_iter()
            .map(|server| {
                outcomes.remove(&server).unwrap_or_else(|| StackOutcome {
                    server,
                    ok: false,
                    state: None,
                    error: Some("task aborted".to_string()),
                })
            })
            .collect()
    }
}

#[derive(Clone, Copy)]
enum StackAction {
    Start,
    Stop,
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tokio::time::{sleep, Instant};

    use super::Herd;
    use crate::config::AppConfig;
    use crate::errors::HerdError;
    use crate::logging::log_path;
    use crate::server::{HerdEvent, ServerConfig, ServerState};
    use crate::storage::metrics_path;

    fn shell(name: &str, config: &AppConfig, script: &str) -> ServerConfig {
        ServerConfig::new(
            name,
            &config.base_dir,
            "sh",
            vec!["-c".to_string(), script.to_string()],
            None,
        )
    }

    async fn wait_for_state(herd: &Herd, name: &str, wanted: ServerState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if herd.status(name).await.map(|view| view.runtime.state).ok() == Some(wanted) {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn herd_error(err: &anyhow::Error) -> Option<&HerdError> {
        err.downcast_ref::<HerdError>()
    }

    fn pid_alive(pid: u32) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lifecycle_start_stop_remove_deletes_logs_and_metrics() {
        let config = AppConfig::for_test("engine-lifecycle");
        let herd = Herd::open(&config).await.expect("open herd");

        herd.add_server(shell("a", &config, "echo ready; sleep 30"))
            .await
            .expect("add server");
        let view = herd.start("a").await.expect("start");
        assert_eq!(view.runtime.state, ServerState::Running);

        let deadline = Instant::now() + Duration::from_secs(10);
        while !metrics_path(&config.metrics_dir, "a").exists() {
            assert!(Instant::now() < deadline, "metrics were never flushed");
            sleep(Duration::from_millis(50)).await;
        }
        let logs = herd.logs("a", 10).await.expect("logs");
        assert!(logs.iter().any(|line| line.text == "ready"));
        assert!(herd
            .live_logs("a", 10)
            .iter()
            .any(|line| line.text == "ready"));

        let view = herd.stop("a").await.expect("stop");
        assert_eq!(view.runtime.state, ServerState::Stopped);
        sleep(Duration::from_millis(250)).await;
        let frozen = herd.live_metrics("a", usize::MAX).len();
        sleep(Duration::from_millis(350)).await;
        assert_eq!(herd.live_metrics("a", usize::MAX).len(), frozen);

        herd.clear_logs("a").await.expect("clear logs");
        assert!(herd.logs("a", 10).await.expect("logs").is_empty());
        assert!(herd.live_logs("a", 10).is_empty());

        herd.remove_server("a", false).await.expect("remove");
        let names: Vec<String> = herd
            .list_servers()
            .await
            .expect("list")
            .into_iter()
            .map(|view| view.config.name)
            .collect();
        assert!(!names.contains(&"a".to_string()));
        assert!(!log_path(&config.log_dir, "a").exists());
        assert!(!metrics_path(&config.metrics_dir, "a").exists());

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_executable_ends_crashed_without_process() {
        let config = AppConfig::for_test("engine-missing");
        let herd = Herd::open(&config).await.expect("open herd");

        herd.add_server(ServerConfig::new(
            "b",
            &config.base_dir,
            "nodeherd-no-such-binary",
            Vec::new(),
            None,
        ))
        .await
        .expect("add server");

        assert!(herd.start("b").await.is_err());
        let view = herd.status("b").await.expect("status");
        assert_eq!(view.runtime.state, ServerState::Crashed);
        assert_eq!(view.runtime.pid, None);
        assert!(view
            .runtime
            .last_error
            .as_deref()
            .is_some_and(|detail| !detail.is_empty()));

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_stop_does_not_delay_other_servers() {
        let config = AppConfig::for_test("engine-isolation");
        let herd = Herd::open(&config).await.expect("open herd");
        herd.add_server(shell("x", &config, "trap '' TERM; sleep 30"))
            .await
            .expect("add x");
        herd.add_server(shell("y", &config, "sleep 30"))
            .await
            .expect("add y");
        herd.start("x").await.expect("start x");
        sleep(Duration::from_millis(200)).await;

        let stopper = {
            let herd = herd.clone();
            tokio::spawn(async move { herd.stop("x").await })
        };
        assert!(wait_for_state(&herd, "x", ServerState::Stopping).await);

        let started = Instant::now();
        let view = herd.start("y").await.expect("start y");
        assert_eq!(view.runtime.state, ServerState::Running);
        assert!(
            started.elapsed() < config.supervisor.stop_grace,
            "y waited for x's grace period"
        );

        let stopped = stopper.await.expect("stop task panicked").expect("stop x");
        assert_eq!(stopped.runtime.state, ServerState::Stopped);

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_on_stopped_server_is_silent_and_exit_is_a_crash() {
        let config = AppConfig::for_test("engine-events");
        let herd = Herd::open(&config).await.expect("open herd");
        herd.add_server(shell("c", &config, "exit 7"))
            .await
            .expect("add server");
        let mut events = herd.subscribe();

        let view = herd.stop("c").await.expect("stop is a no-op");
        assert_eq!(view.runtime.state, ServerState::Stopped);
        sleep(Duration::from_millis(100)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, HerdEvent::Status(_)),
                "no status change expected, got {event:?}"
            );
        }

        herd.start("c").await.expect("start");
        assert!(wait_for_state(&herd, "c", ServerState::Crashed).await);
        let view = herd.status("c").await.expect("status");
        assert_eq!(view.runtime.last_exit_code, Some(7));

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let HerdEvent::Status(change) = event {
                transitions.push((change.from, change.to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (ServerState::Stopped, ServerState::Starting),
                (ServerState::Starting, ServerState::Running),
                (ServerState::Running, ServerState::Crashed),
            ]
        );

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_never_leaves_two_processes() {
        let config = AppConfig::for_test("engine-restart");
        let herd = Herd::open(&config).await.expect("open herd");
        herd.add_server(shell("r", &config, "sleep 30"))
            .await
            .expect("add server");
        let first = herd.start("r").await.expect("start");

        let mut tasks = Vec::new();
        for idx in 0..6 {
            let herd = herd.clone();
            tasks.push(tokio::spawn(async move {
                if idx % 2 == 0 {
                    herd.restart("r").await
                } else {
                    herd.start("r").await
                }
            }));
        }
        let mut pids = vec![first.runtime.pid];
        for task in tasks {
            if let Ok(view) = task.await.expect("task panicked") {
                pids.push(view.runtime.pid);
            }
        }

        let current = herd.status("r").await.expect("status");
        assert_eq!(current.runtime.state, ServerState::Running);
        assert_eq!(current.runtime.restart_count, 3);
        let current_pid = current.runtime.pid.expect("running pid");
        sleep(Duration::from_millis(200)).await;
        for pid in pids.into_iter().flatten() {
            if pid != current_pid {
                assert!(!pid_alive(pid), "stale process {pid} still alive");
            }
        }

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_and_removal_respect_running_state() {
        let config = AppConfig::for_test("engine-edit");
        let herd = Herd::open(&config).await.expect("open herd");
        let original = herd
            .add_server(shell("e", &config, "sleep 30"))
            .await
            .expect("add server");
        herd.start("e").await.expect("start");

        let mut replacement = shell("renamed", &config, "sleep 60");
        replacement.port = Some(3100);
        let err = herd
            .update_server("e", replacement.clone())
            .await
            .expect_err("edit while running");
        assert!(matches!(herd_error(&err), Some(HerdError::InUse { .. })));
        let err = herd.remove_server("e", false).await.expect_err("remove while running");
        assert!(matches!(herd_error(&err), Some(HerdError::InUse { .. })));

        herd.stop("e").await.expect("stop");
        let updated = herd.update_server("e", replacement).await.expect("edit");
        assert_eq!(updated.config.name, "e");
        assert_eq!(updated.config.port, Some(3100));
        assert_eq!(updated.config.created_at, original.config.created_at);

        herd.start("e").await.expect("start again");
        herd.remove_server("e", true).await.expect("forced remove");
        let err = herd.status("e").await.expect_err("gone");
        assert!(matches!(herd_error(&err), Some(HerdError::NotFound(_))));

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stacks_reach_every_member_and_survive_reopen() {
        let config = AppConfig::for_test("engine-stacks");
        {
            let herd = Herd::open(&config).await.expect("open herd");
            for name in ["s1", "s2", "s3"] {
                herd.add_server(shell(name, &config, "sleep 30"))
                    .await
                    .expect("add server");
            }
            herd.add_stack("dev", vec!["s1".to_string(), "s3".to_string()])
                .await
                .expect("add stack");

            let outcomes = herd.start_stack("dev").await.expect("start stack");
            assert_eq!(outcomes.len(), 2);
            assert!(outcomes.iter().all(|outcome| outcome.ok));
            assert_eq!(outcomes[0].server, "s1");
            assert_eq!(herd.status("s2").await.expect("s2").runtime.state, ServerState::Stopped);

            let outcomes = herd.stop_stack("dev").await.expect("stop stack");
            assert!(outcomes
                .iter()
                .all(|outcome| outcome.state == Some(ServerState::Stopped)));
            herd.shutdown().await.expect("shutdown");
        }

        let herd = Herd::open(&config).await.expect("reopen herd");
        let names: Vec<String> = herd
            .list_servers()
            .await
            .expect("list")
            .into_iter()
            .map(|view| view.config.name)
            .collect();
        assert_eq!(names, vec!["s1", "s2", "s3"]);
        let stacks = herd.list_stacks().await.expect("stacks");
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].servers, vec!["s1", "s3"]);
        let err = herd.start_stack("missing").await.expect_err("unknown stack");
        assert!(matches!(herd_error(&err), Some(HerdError::StackNotFound(_))));

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }
}
