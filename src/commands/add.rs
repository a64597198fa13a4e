use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cli::split_args;
use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::server::ServerConfig;

use super::common::expect_ok;

pub(crate) async fn run(
    config: &AppConfig,
    name: String,
    path: PathBuf,
    command: Option<String>,
    args: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let server = ServerConfig::new(
        name,
        resolve_path(&path)?,
        command.unwrap_or_else(|| config.node_command.clone()),
        split_args(args.as_deref())?,
        port,
    );

    let response = send_request(&config.daemon_addr, &IpcRequest::Add { config: server }).await?;
    let response = expect_ok(response)?;
    println!("{}", response.message);

    Ok(())
}

/// The daemon runs from another directory, so relative paths are made
/// absolute against the caller's working directory.
pub(super) fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(path))
}
