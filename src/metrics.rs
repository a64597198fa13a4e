use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::HerdError;
use crate::server::{now_epoch_millis, HerdEvent, MetricSample, ServerState};
use crate::storage::{append_metrics, delete_metrics, load_metrics, prune_all_metrics};
use crate::supervisor::RuntimeTable;

#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub tick: Duration,
    pub flush_every_ticks: u32,
    pub ring_capacity: usize,
    pub smoothing_window: usize,
    pub max_age: Duration,
    pub prune_every_flushes: u32,
    /// Upper bound for one OS query before the tick is counted as a miss.
    pub query_timeout: Duration,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            flush_every_ticks: 10,
            ring_capacity: 3600,
            smoothing_window: 5,
            max_age: Duration::from_secs(24 * 60 * 60),
            prune_every_flushes: 360,
            query_timeout: Duration::from_millis(500),
        }
    }
}

enum SamplerCommand {
    Forget { name: String, reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

type SharedRings = Arc<Mutex<HashMap<String, VecDeque<MetricSample>>>>;

#[derive(Clone)]
pub struct MetricsHandle {
    tx: mpsc::UnboundedSender<SamplerCommand>,
    rings: SharedRings,
    metrics_dir: PathBuf,
}

impl MetricsHandle {
    /// Newest in-memory samples for `name`, oldest first.
    pub fn live(&self, name: &str, max: usize) -> Vec<MetricSample> {
        let rings = lock(&self.rings);
        let Some(ring) = rings.get(name) else {
            return Vec::new();
        };
        let skip = ring.len().saturating_sub(max);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn history(&self, name: &str, since_ms: Option<u64>) -> Result<Vec<MetricSample>> {
        let persisted = load_metrics(&self.metrics_dir, name, since_ms)?;
        let recent = self.live(name, usize::MAX);
        Ok(merge_history(persisted, recent, since_ms))
    }

    /// Drops every sample of `name`, in memory and on disk.
    pub async fn forget(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| SamplerCommand::Forget { name, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| SamplerCommand::Shutdown { reply })
            .await
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<()>) -> SamplerCommand,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| HerdError::Unavailable("metrics sampler"))?;
        reply_rx
            .await
            .map_err(|_| HerdError::Unavailable("metrics sampler"))?;
        Ok(())
    }
}

#[derive(Default)]
struct Series {
    pending: Vec<MetricSample>,
    cpu_window: VecDeque<f32>,
    last_timestamp_ms: u64,
}

struct Sampler {
    settings: SamplerSettings,
    metrics_dir: PathBuf,
    table: RuntimeTable,
    events: broadcast::Sender<HerdEvent>,
    rings: SharedRings,
    series: HashMap<String, Series>,
    system: Arc<Mutex<System>>,
    ticks: u64,
    flushes: u64,
}

pub fn spawn_sampler(
    settings: SamplerSettings,
    metrics_dir: PathBuf,
    table: RuntimeTable,
    events: broadcast::Sender<HerdEvent>,
) -> MetricsHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let rings: SharedRings = Arc::new(Mutex::new(HashMap::new()));
    let sampler = Sampler {
        settings,
        metrics_dir: metrics_dir.clone(),
        table,
        events,
        rings: rings.clone(),
        series: HashMap::new(),
        system: Arc::new(Mutex::new(System::new())),
        ticks: 0,
        flushes: 0,
    };
    sampler.prune();
    tokio::spawn(sampler.run(rx));

    MetricsHandle {
        tx,
        rings,
        metrics_dir,
    }
}

impl Sampler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SamplerCommand>) {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                command = rx.recv() => match command {
                    Some(SamplerCommand::Forget { name, reply }) => {
                        self.forget(&name);
                        let _ = reply.send(());
                    }
                    Some(SamplerCommand::Shutdown { reply }) => {
                        self.flush();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.flush();
                        break;
                    }
                }
            }
        }
        debug!("metrics sampler stopped");
    }

    async fn tick(&mut self) {
        let running = self.running_pids().await;
        for (name, series) in self.series.iter_mut() {
            if !running.iter().any(|(running_name, _)| running_name == name) {
                series.cpu_window.clear();
            }
        }

        if !running.is_empty() {
            let readings = self.query(&running).await;
            // Drop readings for servers that left Running while the query ran.
            let still_running = self.running_pids().await;
            for (name, pid, cpu, memory) in readings {
                if still_running.contains(&(name.clone(), pid)) {
                    self.record(name, cpu, memory);
                }
            }
        }

        self.ticks += 1;
        if self.ticks % u64::from(self.settings.flush_every_ticks.max(1)) == 0 {
            self.flush();
        }
    }

    async fn running_pids(&self) -> Vec<(String, u32)> {
        self.table
            .read()
            .await
            .iter()
            .filter(|(_, runtime)| runtime.state == ServerState::Running)
            .filter_map(|(name, runtime)| runtime.pid.map(|pid| (name.clone(), pid)))
            .collect()
    }

    /// Refreshes the given pids on a blocking thread. Misses are simply absent.
    async fn query(&self, running: &[(String, u32)]) -> Vec<(String, u32, f32, u64)> {
        let system = self.system.clone();
        let targets = running.to_vec();
        let task = tokio::task::spawn_blocking(move || {
            let Ok(mut system) = system.try_lock() else {
                return Vec::new();
            };
            let pids: Vec<SysPid> = targets
                .iter()
                .map(|(_, pid)| SysPid::from_u32(*pid))
                .collect();
            system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
            targets
                .into_iter()
                .filter_map(|(name, pid)| {
                    system
                        .process(SysPid::from_u32(pid))
                        .map(|process| (name, pid, process.cpu_usage(), process.memory()))
                })
                .collect()
        });

        match timeout(self.settings.query_timeout, task).await {
            Ok(Ok(readings)) => readings,
            Ok(Err(err)) => {
                warn!("metrics query task failed: {err}");
                Vec::new()
            }
            Err(_) => {
                debug!("metrics query timed out; skipping tick");
                Vec::new()
            }
        }
    }

    fn record(&mut self, name: String, raw_cpu: f32, memory_bytes: u64) {
        let series = self.series.entry(name.clone()).or_default();
        let cpu_percent = smooth_cpu(
            &mut series.cpu_window,
            raw_cpu,
            self.settings.smoothing_window,
        );
        let timestamp_ms = next_timestamp(series.last_timestamp_ms, now_epoch_millis());
        series.last_timestamp_ms = timestamp_ms;

        let sample = MetricSample {
            server: name.clone(),
            timestamp_ms,
            cpu_percent,
            memory_bytes,
        };
        series.pending.push(sample.clone());

        {
            let mut rings = lock(&self.rings);
            let ring = rings.entry(name).or_default();
            ring.push_back(sample.clone());
            while ring.len() > self.settings.ring_capacity.max(1) {
                ring.pop_front();
            }
        }
        let _ = self.events.send(HerdEvent::Sample(sample));
    }

    fn flush(&mut self) {
        let mut written = 0usize;
        for (name, series) in self.series.iter_mut() {
            if series.pending.is_empty() {
                continue;
            }
            match append_metrics(&self.metrics_dir, name, &series.pending) {
                Ok(()) => {
                    written += series.pending.len();
                    series.pending.clear();
                }
                Err(err) => {
                    warn!(
                        "failed to flush {} metric sample(s) for {name}; will retry: {err:#}",
                        series.pending.len()
                    );
                }
            }
        }
        if written > 0 {
            debug!("flushed {written} metric sample(s)");
        }

        self.flushes += 1;
        if self.flushes % u64::from(self.settings.prune_every_flushes.max(1)) == 0 {
            self.prune();
        }
    }

    fn forget(&mut self, name: &str) {
        self.series.remove(name);
        lock(&self.rings).remove(name);
        if let Err(err) = delete_metrics(&self.metrics_dir, name) {
            warn!("failed to delete metrics for {name}: {err:#}");
        }
    }

    fn prune(&self) {
        let max_age_ms = self.settings.max_age.as_millis() as u64;
        let cutoff_ms = now_epoch_millis().saturating_sub(max_age_ms);
        match prune_all_metrics(&self.metrics_dir, cutoff_ms) {
            Ok(0) => {}
            Ok(dropped) => info!("pruned {dropped} expired metric sample(s)"),
            Err(err) => warn!("failed to prune metrics: {err:#}"),
        }
    }
}

/// Mean of the last `window` raw readings, including `raw`.
fn smooth_cpu(history: &mut VecDeque<f32>, raw: f32, window: usize) -> f32 {
    history.push_back(raw);
    while history.len() > window.max(1) {
        history.pop_front();
    }
    history.iter().sum::<f32>() / history.len() as f32
}

fn next_timestamp(last_ms: u64, now_ms: u64) -> u64 {
    now_ms.max(last_ms.saturating_add(1))
}

fn merge_history(
    persisted: Vec<MetricSample>,
    recent: Vec<MetricSample>,
    since_ms: Option<u64>,
) -> Vec<MetricSample> {
    let since_ms = since_ms.unwrap_or(0);
    let mut merged: Vec<MetricSample> = persisted
        .into_iter()
        .chain(recent)
        .filter(|sample| sample.timestamp_ms >= since_ms)
        .collect();
    merged.sort_by_key(|sample| sample.timestamp_ms);
    merged.dedup_by_key(|sample| sample.timestamp_ms);
    merged
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
