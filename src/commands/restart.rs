use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::{expect_ok, print_server_summary};

pub(crate) async fn run(config: &AppConfig, name: String) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Restart { name }).await?;
    let response = expect_ok(response)?;
    print_server_summary(&response);

    Ok(())
}
