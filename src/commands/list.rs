use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::server::{MetricSample, ServerState, ServerView};
use crate::ui;

use super::common::{expect_ok, optional, port_label};

const HEADERS: [&str; 9] = [
    "NAME", "STATE", "PID", "PORT", "UPTIME", "RESTARTS", "CPU%", "RAM(MB)", "COMMAND",
];
const STATE_COLUMN: usize = 1;

pub(crate) async fn run(config: &AppConfig) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::List).await?;
    let response = expect_ok(response)?;
    print_server_table(response.servers, &response.samples);

    Ok(())
}

fn print_server_table(servers: Vec<ServerView>, samples: &[MetricSample]) {
    if servers.is_empty() {
        println!("No managed servers.");
        return;
    }

    let rows: Vec<(ServerState, [String; 9])> = servers
        .iter()
        .map(|view| {
            let sample = samples
                .iter()
                .find(|sample| sample.server == view.config.name);
            row_for(view, sample)
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for (_, row) in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.len());
        }
    }

    print_border(&widths);
    print!("{}", ui::table_border("|"));
    for (idx, header) in HEADERS.iter().enumerate() {
        let padded = format!(" {:<width$} ", header, width = widths[idx]);
        print!("{}{}", ui::table_header(&padded), ui::table_border("|"));
    }
    println!();
    print_border(&widths);
    for (state, row) in &rows {
        print!("{}", ui::table_border("|"));
        for (idx, cell) in row.iter().enumerate() {
            let padded = format!(" {:<width$} ", cell, width = widths[idx]);
            let cell = if idx == STATE_COLUMN {
                ui::style_state_cell(&padded, *state)
            } else {
                padded
            };
            print!("{}{}", cell, ui::table_border("|"));
        }
        println!();
    }
    print_border(&widths);
}

/// Resource columns show the latest sample only while the server is running.
fn row_for(view: &ServerView, sample: Option<&MetricSample>) -> (ServerState, [String; 9]) {
    let runtime = &view.runtime;
    let sample = sample.filter(|_| runtime.state == ServerState::Running);
    (
        runtime.state,
        [
            view.config.name.clone(),
            runtime.state.to_string(),
            optional(runtime.pid),
            port_label(view),
            ui::format_process_uptime(runtime.state, runtime.started_at),
            runtime.restart_count.to_string(),
            sample.map_or_else(|| "-".to_string(), |sample| format!("{:.1}", sample.cpu_percent)),
            sample.map_or_else(|| "-".to_string(), |sample| ui::format_megabytes(sample.memory_bytes)),
            view.config.command_line(),
        ],
    )
}

fn print_border(widths: &[usize; 9]) {
    let mut line = String::from("+");
    for width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    println!("{}", ui::table_border(&line));
}
