use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

const BUILD_VERSION: &str = env!("NODEHERD_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Runtime:
    list/ls/ps, status, logs/log, metrics, watch
  Lifecycle:
    start, stop, restart/rs
  Config:
    add, edit, remove/rm, stack
  Platform:
    daemon

Compatibility Aliases
  list    -> ls, ps
  remove  -> rm
  restart -> rs
  logs    -> log

Examples
  nodeherd add api ./services/api --command node --args \"--max-old-space-size=512 server.js\"
  nodeherd start api
  nodeherd log api -f
  nodeherd watch api --no-samples
  nodeherd stack add dev api,worker
  nodeherd stack start dev
";

#[derive(Debug, Parser)]
#[command(
    name = "nodeherd",
    version = BUILD_VERSION,
    about = "Supervisor for local Node.js servers",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register a server. PATH is a project directory or a script file.
    Add {
        name: String,
        path: PathBuf,
        /// Executable to run. Defaults to $NODEHERD_NODE_COMMAND, then `node`.
        #[arg(long)]
        command: Option<String>,
        /// Arguments as one shell-quoted string.
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,
    },
    /// Change the configuration of a stopped server.
    Edit {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..), conflicts_with = "clear_port")]
        port: Option<u16>,
        #[arg(long)]
        clear_port: bool,
    },
    #[command(visible_alias = "rm")]
    Remove {
        name: String,
        /// Stop the server first if it is running.
        #[arg(long, short = 'f')]
        force: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    #[command(visible_alias = "rs")]
    Restart {
        name: String,
    },
    #[command(visible_aliases = ["ls", "ps"])]
    List,
    Status {
        name: String,
    },
    #[command(visible_alias = "log")]
    Logs {
        name: String,
        #[arg(short = 'f', long)]
        follow: bool,
        #[arg(long, default_value_t = 100)]
        lines: usize,
        /// Delete the stored log instead of printing it.
        #[arg(long, conflicts_with = "follow")]
        clear: bool,
    },
    Metrics {
        name: String,
        /// Only samples from the last N minutes.
        #[arg(long)]
        since_mins: Option<u64>,
        /// Print at most this many of the newest samples.
        #[arg(long, default_value_t = 20)]
        last: usize,
    },
    /// Stream state changes, resource samples and output as they happen.
    Watch {
        /// Only events of this server.
        name: Option<String>,
        #[arg(long)]
        no_samples: bool,
        #[arg(long)]
        no_logs: bool,
    },
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum StackCommand {
    Add {
        name: String,
        #[arg(value_delimiter = ',', num_args = 0..)]
        servers: Vec<String>,
    },
    Edit {
        name: String,
        #[arg(value_delimiter = ',', num_args = 0..)]
        servers: Vec<String>,
    },
    #[command(visible_alias = "rm")]
    Remove {
        name: String,
    },
    #[command(visible_alias = "ls")]
    List,
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    Run,
    Stop,
}

/// Splits a shell-quoted argument string. `None` yields no arguments.
pub fn split_args(raw: Option<&str>) -> Result<Vec<String>> {
    match raw {
        Some(raw) => {
            shell_words::split(raw).with_context(|| format!("invalid argument string: {raw}"))
        }
        None => Ok(Vec::new()),
    }
}
