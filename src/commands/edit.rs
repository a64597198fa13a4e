use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::cli::split_args;
use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::server::ServerConfig;

use super::add::resolve_path;
use super::common::expect_ok;

pub(crate) struct EditArgs {
    pub(crate) path: Option<PathBuf>,
    pub(crate) command: Option<String>,
    pub(crate) args: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) clear_port: bool,
}

pub(crate) async fn run(config: &AppConfig, name: String, edit: EditArgs) -> Result<()> {
    let response = send_request(
        &config.daemon_addr,
        &IpcRequest::Status { name: name.clone() },
    )
    .await?;
    let current = expect_ok(response)?
        .server
        .context("daemon returned no server for edit command")?
        .config;

    let updated = merge(current, edit)?;
    let response = send_request(
        &config.daemon_addr,
        &IpcRequest::Edit {
            name,
            config: updated,
        },
    )
    .await?;
    let response = expect_ok(response)?;
    println!("{}", response.message);

    Ok(())
}

/// Overlays the supplied flags on the stored config; absent flags keep
/// their current value.
fn merge(mut current: ServerConfig, edit: EditArgs) -> Result<ServerConfig> {
    if let Some(path) = edit.path {
        current.path = resolve_path(&path)?;
    }
    if let Some(command) = edit.command {
        current.command = command;
    }
    if edit.args.is_some() {
        current.args = split_args(edit.args.as_deref())?;
    }
    if edit.clear_port {
        current.port = None;
    } else if edit.port.is_some() {
        current.port = edit.port;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{merge, EditArgs};
    use crate::server::ServerConfig;

    fn unchanged() -> EditArgs {
        EditArgs {
            path: None,
            command: None,
            args: None,
            port: None,
            clear_port: false,
        }
    }

    #[test]
    fn merge_keeps_fields_without_flags() {
        let current = ServerConfig::new(
            "api",
            "/srv/api",
            "node",
            vec!["server.js".to_string()],
            Some(3000),
        );
        let merged = merge(current.clone(), unchanged()).expect("merge");
        assert_eq!(merged, current);
    }

    #[test]
    fn merge_overrides_and_clears() {
        let current = ServerConfig::new("api", "/srv/api", "node", Vec::new(), Some(3000));
        let merged = merge(
            current,
            EditArgs {
                path: Some(PathBuf::from("/srv/next")),
                command: Some("bun".to_string()),
                args: Some("run 'dev server'".to_string()),
                port: None,
                clear_port: true,
            },
        )
        .expect("merge");

        assert_eq!(merged.name, "api");
        assert_eq!(merged.path, PathBuf::from("/srv/next"));
        assert_eq!(merged.command, "bun");
        assert_eq!(merged.args, vec!["run", "dev server"]);
        assert_eq!(merged.port, None);
    }

    #[test]
    fn merge_sets_new_port() {
        let current = ServerConfig::new("api", "/srv/api", "node", Vec::new(), None);
        let merged = merge(
            current,
            EditArgs {
                port: Some(8080),
                ..unchanged()
            },
        )
        .expect("merge");
        assert_eq!(merged.port, Some(8080));
    }
}
