mod add;
mod common;
mod daemon_stop;
mod edit;
mod list;
mod logs;
mod metrics;
mod remove;
mod restart;
mod stack;
mod start;
mod status;
mod stop;
mod watch;

use anyhow::Result;

use crate::cli::{Commands, DaemonCommand};
use crate::config::AppConfig;

pub async fn run(command: Commands, config: &AppConfig) -> Result<()> {
    let needs_daemon = !matches!(
        command,
        Commands::Daemon {
            command: DaemonCommand::Stop,
        }
    );

    if needs_daemon {
        crate::daemon::ensure_daemon_running(config).await?;
    }

    match command {
        Commands::Add {
            name,
            path,
            command,
            args,
            port,
        } => add::run(config, name, path, command, args, port).await,
        Commands::Edit {
            name,
            path,
            command,
            args,
            port,
            clear_port,
        } => {
            edit::run(
                config,
                name,
                edit::EditArgs {
                    path,
                    command,
                    args,
                    port,
                    clear_port,
                },
            )
            .await
        }
        Commands::Remove { name, force } => remove::run(config, name, force).await,
        Commands::Start { name } => start::run(config, name).await,
        Commands::Stop { name } => stop::run(config, name).await,
        Commands::Restart { name } => restart::run(config, name).await,
        Commands::List => list::run(config).await,
        Commands::Status { name } => status::run(config, name).await,
        Commands::Logs {
            name,
            follow,
            lines,
            clear,
        } => {
            if clear {
                logs::clear(config, name).await
            } else {
                logs::run(config, name, follow, lines).await
            }
        }
        Commands::Metrics {
            name,
            since_mins,
            last,
        } => metrics::run(config, name, since_mins, last).await,
        Commands::Watch {
            name,
            no_samples,
            no_logs,
        } => {
            watch::run(
                config,
                name,
                watch::Filter {
                    samples: !no_samples,
                    logs: !no_logs,
                },
            )
            .await
        }
        Commands::Stack { command } => stack::run(config, command).await,
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => unreachable!("daemon mode is handled before CLI dispatch"),
        Commands::Daemon {
            command: DaemonCommand::Stop,
        } => daemon_stop::run(config).await,
    }
}
