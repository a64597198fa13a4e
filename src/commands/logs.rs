use anyhow::Result;
use tokio::time::{sleep, Duration};

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::server::{LogLine, LogStream};
use crate::ui;

use super::common::expect_ok;

const FOLLOW_POLL: Duration = Duration::from_millis(500);
const FOLLOW_WINDOW: usize = 500;

pub(crate) async fn run(config: &AppConfig, name: String, follow: bool, lines: usize) -> Result<()> {
    let initial = fetch(config, &name, lines, false).await?;
    for line in &initial {
        print_line(line);
    }

    if follow {
        follow_logs(config, name, initial.last().cloned()).await?;
    }

    Ok(())
}

pub(crate) async fn clear(config: &AppConfig, name: String) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::LogsClear { name }).await?;
    let response = expect_ok(response)?;
    println!("{}", response.message);

    Ok(())
}

async fn fetch(config: &AppConfig, name: &str, lines: usize, live: bool) -> Result<Vec<LogLine>> {
    let response = send_request(
        &config.daemon_addr,
        &IpcRequest::Logs {
            name: name.to_string(),
            lines,
            live,
        },
    )
    .await?;
    Ok(expect_ok(response)?.logs)
}

async fn follow_logs(config: &AppConfig, name: String, mut last: Option<LogLine>) -> Result<()> {
    println!("Following logs (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = sleep(FOLLOW_POLL) => {}
        }

        let batch = fetch(config, &name, FOLLOW_WINDOW, true).await?;
        let fresh = unseen(last.as_ref(), &batch);
        for line in fresh {
            print_line(line);
        }
        if let Some(line) = fresh.last() {
            last = Some(line.clone());
        }
    }
}

/// Lines of `batch` that come after `last`. When `last` has been trimmed
/// away, everything newer than its timestamp is returned.
fn unseen<'a>(last: Option<&LogLine>, batch: &'a [LogLine]) -> &'a [LogLine] {
    let Some(last) = last else {
        return batch;
    };
    if let Some(idx) = batch.iter().rposition(|line| line == last) {
        return &batch[idx + 1..];
    }
    let start = batch
        .iter()
        .position(|line| line.timestamp_ms > last.timestamp_ms)
        .unwrap_or(batch.len());
    &batch[start..]
}

fn print_line(line: &LogLine) {
    let stream = match line.stream {
        LogStream::Stdout => "out",
        LogStream::Stderr => "err",
    };
    println!(
        "{} [{stream}] {:<7} {}",
        ui::format_clock(line.timestamp_ms),
        ui::severity_value(line.severity),
        line.text
    );
}
