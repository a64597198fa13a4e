use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::server::{MetricSample, ServerConfig, Stack};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedConfigs {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub stacks: Vec<Stack>,
}

/// Never fails: a missing, unreadable or corrupt file yields an empty set.
pub fn load_configs(path: &Path) -> PersistedConfigs {
    if !path.exists() {
        return PersistedConfigs::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "failed to read config file {}: {err}; starting empty",
                path.display()
            );
            return PersistedConfigs::default();
        }
    };

    if content.trim().is_empty() {
        return PersistedConfigs::default();
    }

    match serde_json::from_str::<PersistedConfigs>(&content) {
        Ok(configs) => configs,
        Err(error) => {
            let backup = corrupted_backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted config file {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "config file {} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            PersistedConfigs::default()
        }
    }
}

pub fn save_configs(path: &Path, configs: &PersistedConfigs) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(configs)?;
    let tmp_path = tmp_path(path);

    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write temporary config {}", tmp_path.display()))?;
    replace_file(&tmp_path, path)?;

    Ok(())
}

pub fn metrics_path(metrics_dir: &Path, name: &str) -> PathBuf {
    metrics_dir.join(format!("{}.jsonl", sanitize_file_stem(name)))
}

pub fn append_metrics(metrics_dir: &Path, name: &str, samples: &[MetricSample]) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(metrics_dir)
        .with_context(|| format!("failed to create {}", metrics_dir.display()))?;

    let path = metrics_path(metrics_dir, name);
    let mut payload = Vec::with_capacity(samples.len() * 96);
    for sample in samples {
        serde_json::to_writer(&mut payload, sample)?;
        payload.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed opening {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed appending metrics to {}", path.display()))?;
    Ok(())
}

/// Chronological samples at or after `since_ms`. Unreadable lines are skipped.
pub fn load_metrics(
    metrics_dir: &Path,
    name: &str,
    since_ms: Option<u64>,
) -> Result<Vec<MetricSample>> {
    let path = metrics_path(metrics_dir, name);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut samples: Vec<MetricSample> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<MetricSample>(line) {
            Ok(sample) => Some(sample),
            Err(err) => {
                debug!("skipping unreadable metric line in {}: {err}", path.display());
                None
            }
        })
        .filter(|sample| since_ms.map_or(true, |since| sample.timestamp_ms >= since))
        .collect();
    samples.sort_by_key(|sample| sample.timestamp_ms);
    Ok(samples)
}

/// Drops samples older than `cutoff_ms`. Returns how many were removed.
pub fn prune_metrics(metrics_dir: &Path, name: &str, cutoff_ms: u64) -> Result<usize> {
    let path = metrics_path(metrics_dir, name);
    if !path.exists() {
        return Ok(0);
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut kept = String::with_capacity(content.len());
    let mut removed = 0usize;
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<MetricSample>(line) {
            Ok(sample) if sample.timestamp_ms < cutoff_ms => removed += 1,
            Ok(_) => {
                kept.push_str(line);
                kept.push('\n');
            }
            Err(_) => removed += 1,
        }
    }

    if removed > 0 {
        let tmp_path = tmp_path(&path);
        fs::write(&tmp_path, kept)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        replace_file(&tmp_path, &path)?;
    }
    Ok(removed)
}

/// Prunes every series file in the directory.
pub fn prune_all_metrics(metrics_dir: &Path, cutoff_ms: u64) -> Result<usize> {
    if !metrics_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0usize;
    let entries = fs::read_dir(metrics_dir)
        .with_context(|| format!("failed to read directory {}", metrics_dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|value| value.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|value| value.to_str()) else {
            continue;
        };
        match prune_metrics(metrics_dir, stem, cutoff_ms) {
            Ok(count) => removed += count,
            Err(err) => warn!("failed to prune metrics in {}: {err:#}", path.display()),
        }
    }
    Ok(removed)
}

pub fn delete_metrics(metrics_dir: &Path, name: &str) -> Result<()> {
    let path = metrics_path(metrics_dir, name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to delete {}", path.display())),
    }
}

/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `_`.
pub fn sanitize_file_stem(name: &str) -> String {
    let value: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = value.trim_start_matches('.');
    if trimmed.is_empty() {
        "server".to_string()
    } else {
        trimmed.to_string()
    }
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

pub(crate) fn replace_file(tmp_path: &Path, path: &Path) -> Result<()> {
    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            #[cfg(windows)]
            {
                if path.exists() {
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                    fs::rename(tmp_path, path)
                        .with_context(|| format!("failed to replace {}", path.display()))?;
                    return Ok(());
                }
            }

            Err(rename_err).with_context(|| format!("failed to replace {}", path.display()))
        }
    }
}
