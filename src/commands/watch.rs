use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::watch;
use crate::server::{HerdEvent, LogStream};
use crate::ui;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Filter {
    pub samples: bool,
    pub logs: bool,
}

pub(crate) async fn run(config: &AppConfig, name: Option<String>, filter: Filter) -> Result<()> {
    let mut events = watch(&config.daemon_addr, name).await?;
    println!("Watching events (Ctrl-C to stop)...");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.next() => event?,
        };
        let Some(event) = event else {
            println!("Daemon closed the event stream.");
            return Ok(());
        };
        if let Some(line) = render(&event, filter) {
            println!("{line}");
        }
    }
}

fn render(event: &HerdEvent, filter: Filter) -> Option<String> {
    match event {
        HerdEvent::Status(change) => Some(format!(
            "{} {} {} -> {}",
            ui::format_clock(change.at_ms),
            change.name,
            change.from,
            ui::state_value(change.to)
        )),
        HerdEvent::Sample(sample) if filter.samples => Some(format!(
            "{} {} cpu {:.1}% ram {} MB",
            ui::format_clock(sample.timestamp_ms),
            sample.server,
            sample.cpu_percent,
            ui::format_megabytes(sample.memory_bytes)
        )),
        HerdEvent::Log(line) if filter.logs => {
            let stream = match line.stream {
                LogStream::Stdout => "out",
                LogStream::Stderr => "err",
            };
            Some(format!(
                "{} {} [{stream}] {} {}",
                ui::format_clock(line.timestamp_ms),
                line.server,
                ui::severity_value(line.severity),
                line.text
            ))
        }
        HerdEvent::Sample(_) | HerdEvent::Log(_) => None,
    }
}
