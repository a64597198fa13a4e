use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::expect_ok;

pub(crate) async fn run(config: &AppConfig, name: String) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Stop { name }).await?;
    let response = expect_ok(response)?;
    println!("{}", response.message);

    Ok(())
}
