use anyhow::Result;

use crate::ipc::IpcResponse;
use crate::server::ServerView;

pub(crate) fn expect_ok(response: IpcResponse) -> Result<IpcResponse> {
    if response.ok {
        Ok(response)
    } else {
        anyhow::bail!(response.message)
    }
}

pub(crate) fn print_server_summary(response: &IpcResponse) {
    println!("{}", response.message);
    if let Some(view) = response.server.as_ref() {
        println!("  pid:  {}", optional(view.runtime.pid));
        println!("  port: {}", port_label(view));
    }
}

/// Configured port, or the detected one marked with `*`.
pub(crate) fn port_label(view: &ServerView) -> String {
    match view.effective_port() {
        Some(port) if view.config.port.is_some() => port.to_string(),
        Some(port) => format!("{port}*"),
        None => "-".to_string(),
    }
}

pub(crate) fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}
