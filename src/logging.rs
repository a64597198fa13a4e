use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::server::{now_epoch_millis, HerdEvent, LogLine, LogStream, Severity};
use crate::storage::{replace_file, sanitize_file_stem, tmp_path};

/// Bounds applied to each server's durable log.
#[derive(Debug, Clone, Copy)]
pub struct LogRetentionPolicy {
    pub max_bytes: u64,
    pub max_lines: usize,
    /// Lines kept in memory per server for live consumers.
    pub live_lines: usize,
}

/// Ordered marker table; the first case-insensitive substring match wins.
#[derive(Debug, Clone)]
pub struct SeverityRules {
    rules: Vec<(String, Severity)>,
}

impl SeverityRules {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = (S, Severity)>,
        S: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(marker, severity)| (marker.into().to_ascii_lowercase(), severity))
                .filter(|(marker, _)| !marker.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, text: &str) -> Severity {
        let lowered = text.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|(marker, _)| lowered.contains(marker.as_str()))
            .map(|(_, severity)| *severity)
            .unwrap_or(Severity::Info)
    }
}

impl Default for SeverityRules {
    fn default() -> Self {
        Self::new([
            ("error", Severity::Error),
            ("exception", Severity::Error),
            ("fatal", Severity::Error),
            ("warn", Severity::Warning),
        ])
    }
}

pub enum SinkMessage {
    Line(LogLine),
    Clear,
    Sync(oneshot::Sender<()>),
    Delete(oneshot::Sender<()>),
}

/// Receives captured output and owns one append stream per server name.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    log_dir: PathBuf,
    policy: LogRetentionPolicy,
    rules: SeverityRules,
    buffer: usize,
    writers: Mutex<HashMap<String, mpsc::Sender<SinkMessage>>>,
    live: Mutex<HashMap<String, VecDeque<LogLine>>>,
    events: broadcast::Sender<HerdEvent>,
}

impl LogSink {
    pub fn new(
        log_dir: PathBuf,
        policy: LogRetentionPolicy,
        rules: SeverityRules,
        buffer: usize,
        events: broadcast::Sender<HerdEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                log_dir,
                policy,
                rules,
                buffer: buffer.max(1),
                writers: Mutex::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        log_path(&self.inner.log_dir, name)
    }

    pub fn line(&self, name: &str, stream: LogStream, text: String) -> LogLine {
        LogLine {
            server: name.to_string(),
            timestamp_ms: now_epoch_millis(),
            stream,
            severity: self.inner.rules.classify(&text),
            text,
        }
    }

    /// Bounded sender feeding the server's writer task, spawned on first use.
    pub fn channel_for(&self, name: &str) -> mpsc::Sender<SinkMessage> {
        let mut writers = lock(&self.inner.writers);
        if let Some(tx) = writers.get(name).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let writer = LogWriter {
            name: name.to_string(),
            path: self.log_path(name),
            file: None,
            lines: 0,
            bytes: 0,
            sink: self.clone(),
        };
        tokio::spawn(writer.run(rx));
        writers.insert(name.to_string(), tx.clone());
        tx
    }

    /// Waits until the writer has caught up. Does nothing for idle names.
    pub async fn sync(&self, name: &str) {
        let tx = lock(&self.inner.writers).get(name).cloned();
        if let Some(tx) = tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(SinkMessage::Sync(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    pub async fn sync_all(&self) {
        let names: Vec<String> = lock(&self.inner.writers).keys().cloned().collect();
        for name in names {
            self.sync(&name).await;
        }
    }

    pub async fn clear(&self, name: &str) {
        let tx = self.channel_for(name);
        let _ = tx.send(SinkMessage::Clear).await;
        self.sync(name).await;
    }

    /// Stops the writer for `name` and removes its file and live tail.
    pub async fn delete(&self, name: &str) {
        let tx = lock(&self.inner.writers).remove(name);
        let deleted_by_writer = match tx {
            Some(tx) => {
                let (done_tx, done_rx) = oneshot::channel();
                tx.send(SinkMessage::Delete(done_tx)).await.is_ok() && done_rx.await.is_ok()
            }
            None => false,
        };
        if !deleted_by_writer {
            remove_log_file(&self.log_path(name));
        }
        lock(&self.inner.live).remove(name);
    }

    pub fn live_tail(&self, name: &str, max: usize) -> Vec<LogLine> {
        let live = lock(&self.inner.live);
        let Some(lines) = live.get(name) else {
            return Vec::new();
        };
        let skip = lines.len().saturating_sub(max);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Newest persisted lines, oldest first.
    pub fn read_lines(&self, name: &str, max: usize) -> Result<Vec<LogLine>> {
        let raw = read_last_lines(&self.log_path(name), max)?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str::<LogLine>(line).ok())
            .collect())
    }

    fn record_live(&self, line: &LogLine) {
        let capacity = self.inner.policy.live_lines;
        if capacity > 0 {
            let mut live = lock(&self.inner.live);
            let tail = live.entry(line.server.clone()).or_default();
            tail.push_back(line.clone());
            while tail.len() > capacity {
                tail.pop_front();
            }
        }
        let _ = self.inner.events.send(HerdEvent::Log(line.clone()));
    }
}

struct LogWriter {
    name: String,
    path: PathBuf,
    file: Option<File>,
    lines: usize,
    bytes: u64,
    sink: LogSink,
}

impl LogWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<SinkMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                SinkMessage::Line(line) => {
                    if let Err(err) = self.write_line(&line) {
                        warn!("failed to append log line for {}: {err:#}", self.name);
                        self.file = None;
                    }
                    self.sink.record_live(&line);
                }
                SinkMessage::Clear => {
                    self.file = None;
                    remove_log_file(&self.path);
                    lock(&self.sink.inner.live).remove(&self.name);
                }
                SinkMessage::Sync(done) => {
                    if let Some(file) = self.file.as_mut() {
                        let _ = file.flush();
                    }
                    let _ = done.send(());
                }
                SinkMessage::Delete(done) => {
                    self.file = None;
                    remove_log_file(&self.path);
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    fn write_line(&mut self, line: &LogLine) -> Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        let mut payload = serde_json::to_vec(line)?;
        payload.push(b'\n');

        let Some(file) = self.file.as_mut() else {
            anyhow::bail!("log file for {} is not open", self.name);
        };
        file.write_all(&payload)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        self.lines += 1;
        self.bytes += payload.len() as u64;

        let policy = self.sink.inner.policy;
        if self.bytes > policy.max_bytes || self.lines > policy.max_lines {
            self.trim(policy)?;
        }
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let (lines, bytes) = count_lines(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        self.file = Some(file);
        self.lines = lines;
        self.bytes = bytes;
        Ok(())
    }

    /// Rewrites the file keeping the newest lines that fit in 80% of both bounds.
    fn trim(&mut self, policy: LogRetentionPolicy) -> Result<()> {
        self.file = None;
        let content = fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let byte_budget = policy.max_bytes.saturating_mul(4) / 5;
        let line_budget = policy.max_lines.saturating_mul(4) / 5;
        let mut kept: Vec<&[u8]> = Vec::new();
        let mut kept_bytes = 0u64;
        for line in content
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .rev()
        {
            let size = line.len() as u64 + 1;
            // The newest line always survives, even when it alone exceeds the budget.
            if !kept.is_empty() && (kept.len() >= line_budget || kept_bytes + size > byte_budget) {
                break;
            }
            kept_bytes += size;
            kept.push(line);
        }

        let mut payload = Vec::with_capacity(kept_bytes as usize);
        for line in kept.iter().rev() {
            payload.extend_from_slice(line);
            payload.push(b'\n');
        }
        let tmp_path = tmp_path(&self.path);
        fs::write(&tmp_path, &payload)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        replace_file(&tmp_path, &self.path)?;

        debug!(
            "trimmed log for {} to {} lines ({} bytes)",
            self.name,
            kept.len(),
            kept_bytes
        );
        self.open()
    }
}

pub fn log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.log", sanitize_file_stem(name)))
}

fn count_lines(path: &Path) -> Result<(usize, u64)> {
    if !path.exists() {
        return Ok((0, 0));
    }
    let content = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let lines = content.iter().filter(|&&byte| byte == b'\n').count();
    Ok((lines, content.len() as u64))
}

fn remove_log_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove log {}: {err}", path.display());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn read_last_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    if max_lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let mut file =
        File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let total_size = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if total_size == 0 {
        return Ok(Vec::new());
    }

    const CHUNK_SIZE: u64 = 16 * 1024;
    let mut offset = total_size;
    let mut newline_count = 0usize;
    let mut chunks: Vec<Vec<u8>> = Vec::new();

    while offset > 0 && newline_count <= max_lines {
        let read_len = CHUNK_SIZE.min(offset) as usize;
        offset -= read_len as u64;

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed seeking {}", path.display()))?;

        let mut chunk = vec![0_u8; read_len];
        file.read_exact(&mut chunk)
            .with_context(|| format!("failed reading {}", path.display()))?;
        newline_count += chunk.iter().filter(|&&byte| byte == b'\n').count();
        chunks.push(chunk);
    }

    let total_bytes: usize = chunks.iter().map(Vec::len).sum();
    let mut bytes = Vec::with_capacity(total_bytes);
    for chunk in chunks.iter().rev() {
        bytes.extend_from_slice(chunk);
    }
    let text = String::from_utf8_lossy(&bytes);

    let mut ring = VecDeque::with_capacity(max_lines.saturating_add(1));
    for line in text.lines() {
        ring.push_back(line.to_string());
        if ring.len() > max_lines {
            ring.pop_front();
        }
    }

    Ok(ring.into_iter().collect())
}
