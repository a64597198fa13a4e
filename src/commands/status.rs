use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::logging::log_path;
use crate::server::ServerState;
use crate::ui;

use super::common::{expect_ok, optional, port_label};

pub(crate) async fn run(config: &AppConfig, name: String) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Status { name }).await?;
    let response = expect_ok(response)?;

    let view = response
        .server
        .context("daemon returned no server for status command")?;
    let runtime = &view.runtime;

    println!("{}        {}", ui::label("Name:"), view.config.name);
    println!("{}       {}", ui::label("State:"), ui::state_value(runtime.state));
    println!("{}         {}", ui::label("PID:"), optional(runtime.pid));
    println!("{}        {}", ui::label("Port:"), port_label(&view));
    println!(
        "{}      {}",
        ui::label("Uptime:"),
        ui::format_process_uptime(runtime.state, runtime.started_at)
    );
    println!("{}    {}", ui::label("Restarts:"), runtime.restart_count);
    if let Some(sample) = response
        .samples
        .last()
        .filter(|_| runtime.state == ServerState::Running)
    {
        println!("{}         {:.1}%", ui::label("CPU:"), sample.cpu_percent);
        println!(
            "{}         {} MB",
            ui::label("RAM:"),
            ui::format_megabytes(sample.memory_bytes)
        );
    }
    println!("{}   {}", ui::label("Last Exit:"), optional(runtime.last_exit_code));
    if let Some(error) = runtime.last_error.as_deref() {
        println!("{}  {}", ui::label("Last Error:"), error);
    }
    if runtime.dropped_lines > 0 {
        println!("{} {}", ui::label("Dropped Log:"), runtime.dropped_lines);
    }
    println!("{}     {}", ui::label("Command:"), view.config.command_line());
    println!(
        "{} {}",
        ui::label("Working Dir:"),
        view.config.working_dir().display()
    );
    println!(
        "{}         {}",
        ui::label("Log:"),
        log_path(&config.log_dir, &view.config.name).display()
    );

    Ok(())
}
