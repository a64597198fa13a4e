use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::logging::LogRetentionPolicy;
use crate::metrics::SamplerSettings;
use crate::supervisor::SupervisorSettings;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub daemon_addr: String,
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
    pub metrics_dir: PathBuf,
    /// Executable used by `add` when no `--command` is given.
    pub node_command: String,
    pub log_retention: LogRetentionPolicy,
    /// Capacity of each server's bounded output channel, in lines.
    pub log_buffer: usize,
    pub supervisor: SupervisorSettings,
    pub sampler: SamplerSettings,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("NODEHERD_HOME")
            .map(PathBuf::from)
            .ok()
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("nodeherd")
            });
        let daemon_addr = env::var("NODEHERD_DAEMON_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("127.0.0.1:{}", daemon_port()));

        let log_retention = LogRetentionPolicy {
            max_bytes: env_u64("NODEHERD_LOG_MAX_SIZE_KB", 5120)
                .max(1)
                .saturating_mul(1024),
            max_lines: env_u64("NODEHERD_LOG_MAX_LINES", 20_000).max(10) as usize,
            live_lines: 500,
        };
        let supervisor = SupervisorSettings {
            stop_grace: Duration::from_secs(env_u64("NODEHERD_STOP_GRACE_SECS", 5).max(1)),
            ..SupervisorSettings::default()
        };
        let sampler = SamplerSettings {
            // Shorter intervals make sysinfo report CPU usage far too low.
            tick: Duration::from_millis(env_u64("NODEHERD_METRICS_TICK_MS", 1000))
                .max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
            flush_every_ticks: env_u64("NODEHERD_METRICS_FLUSH_TICKS", 10).clamp(1, 3600) as u32,
            ring_capacity: env_u64("NODEHERD_METRICS_RING", 3600).max(1) as usize,
            max_age: Duration::from_secs(
                env_u64("NODEHERD_METRICS_MAX_AGE_HOURS", 24)
                    .max(1)
                    .saturating_mul(3600),
            ),
            ..SamplerSettings::default()
        };

        let mut config =
            Self::with_base(base_dir, daemon_addr, log_retention, supervisor, sampler);
        config.log_buffer = env_u64("NODEHERD_LOG_BUFFER", 1024).clamp(16, 1 << 20) as usize;
        if let Some(command) = env::var("NODEHERD_NODE_COMMAND")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            config.node_command = command;
        }
        config.ensure_layout()?;
        Ok(config)
    }

    fn with_base(
        base_dir: PathBuf,
        daemon_addr: String,
        log_retention: LogRetentionPolicy,
        supervisor: SupervisorSettings,
        sampler: SamplerSettings,
    ) -> Self {
        Self {
            config_path: base_dir.join("servers.json"),
            log_dir: base_dir.join("logs"),
            metrics_dir: base_dir.join("metrics"),
            node_command: "node".to_string(),
            base_dir,
            daemon_addr,
            log_retention,
            log_buffer: 1024,
            supervisor,
            sampler,
        }
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.base_dir, &self.log_dir, &self.metrics_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn daemon_port() -> u16 {
    let identity = current_identity();
    let mut hash = 2166136261_u32;
    for byte in identity.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }

    // High, non-privileged range.
    let range = 20000_u16;
    40000 + (hash % range as u32) as u16
}

fn current_identity() -> String {
    #[cfg(unix)]
    {
        format!("nodeherd-uid-{}", nix::unistd::Uid::effective().as_raw())
    }

    #[cfg(windows)]
    {
        let username = env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string());
        format!("nodeherd-win-{username}")
    }

    #[cfg(not(any(unix, windows)))]
    {
        "nodeherd-generic".to_string()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
impl AppConfig {
    /// Isolated layout under the temp dir with short timings for tests.
    pub(crate) fn for_test(prefix: &str) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let base_dir = env::temp_dir().join(format!("nodeherd-{prefix}-{nonce}"));
        let mut config = Self::with_base(
            base_dir,
            "127.0.0.1:0".to_string(),
            LogRetentionPolicy {
                max_bytes: 1024 * 1024,
                max_lines: 5000,
                live_lines: 200,
            },
            SupervisorSettings {
                stop_grace: Duration::from_secs(2),
                kill_wait: Duration::from_secs(5),
                port_scan_interval: Duration::from_millis(200),
                ..SupervisorSettings::default()
            },
            SamplerSettings {
                tick: Duration::from_millis(100),
                flush_every_ticks: 5,
                query_timeout: Duration::from_secs(2),
                ..SamplerSettings::default()
            },
        );
        config.log_buffer = 256;
        config
    }
}
