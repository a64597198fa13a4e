use anyhow::Result;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration, Instant};

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::expect_ok;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) async fn run(config: &AppConfig) -> Result<()> {
    let response = match send_request(&config.daemon_addr, &IpcRequest::Shutdown).await {
        Ok(response) => expect_ok(response)?,
        Err(_) => {
            println!("Daemon is not running.");
            return Ok(());
        }
    };
    println!("{}", response.message);

    // The daemon stops every server before it releases the socket.
    let settings = &config.supervisor;
    let limit = settings.stop_grace + settings.kill_wait + Duration::from_secs(5);
    if wait_for_exit(&config.daemon_addr, limit).await {
        println!("Daemon stopped.");
    } else {
        println!(
            "Daemon still accepts connections after {}s; it may still be stopping servers.",
            limit.as_secs()
        );
    }
    Ok(())
}

/// Polls until nothing accepts connections on `daemon_addr` or `limit` passes.
async fn wait_for_exit(daemon_addr: &str, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if TcpStream::connect(daemon_addr).await.is_err() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}
