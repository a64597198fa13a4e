use anyhow::Result;

use crate::cli::StackCommand;
use crate::config::AppConfig;
use crate::engine::StackOutcome;
use crate::ipc::{send_request, IpcRequest, IpcResponse};
use crate::server::Stack;
use crate::ui;

use super::common::{expect_ok, optional};

pub(crate) async fn run(config: &AppConfig, command: StackCommand) -> Result<()> {
    let request = match command {
        StackCommand::Add { name, servers } => IpcRequest::StackAdd { name, servers },
        StackCommand::Edit { name, servers } => IpcRequest::StackEdit { name, servers },
        StackCommand::Remove { name } => IpcRequest::StackRemove { name },
        StackCommand::List => IpcRequest::StackList,
        StackCommand::Start { name } => IpcRequest::StackStart { name },
        StackCommand::Stop { name } => IpcRequest::StackStop { name },
    };
    let is_list = matches!(request, IpcRequest::StackList);

    let response = send_request(&config.daemon_addr, &request).await?;
    if !response.stack_results.is_empty() {
        return report_outcomes(response);
    }

    let response = expect_ok(response)?;
    if is_list {
        print_stacks(&response.stacks);
    } else {
        println!("{}", response.message);
    }

    Ok(())
}

/// Prints one line per member and fails when any member failed.
fn report_outcomes(response: IpcResponse) -> Result<()> {
    for outcome in &response.stack_results {
        println!("{}", outcome_line(outcome));
    }

    let failed = response
        .stack_results
        .iter()
        .filter(|outcome| !outcome.ok)
        .count();
    if failed > 0 {
        anyhow::bail!(
            "{failed} of {} stack members failed",
            response.stack_results.len()
        );
    }
    println!("{}", response.message);
    Ok(())
}

fn outcome_line(outcome: &StackOutcome) -> String {
    let state = optional(outcome.state);
    match (&outcome.error, outcome.ok) {
        (Some(error), false) => format!("  {:<20} {:<9} {}", outcome.server, state, error),
        _ => format!("  {:<20} {}", outcome.server, state),
    }
}

fn print_stacks(stacks: &[Stack]) {
    if stacks.is_empty() {
        println!("No stacks defined.");
        return;
    }
    for stack in stacks {
        let members = if stack.servers.is_empty() {
            "-".to_string()
        } else {
            stack.servers.join(", ")
        };
        println!("{} {}", ui::label(&format!("{}:", stack.name)), members);
    }
}
