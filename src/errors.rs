use thiserror::Error;

use crate::server::ServerState;

#[derive(Debug, Error)]
pub enum HerdError {
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("duplicate server name: {0}")]
    DuplicateName(String),
    #[error("server {name} is in use ({state}); stop it first")]
    InUse { name: String, state: ServerState },
    #[error("server {0} is already running")]
    AlreadyRunning(String),
    #[error("invalid server name: {0}")]
    InvalidName(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("stack not found: {0}")]
    StackNotFound(String),
    #[error("duplicate stack name: {0}")]
    DuplicateStack(String),
    #[error("daemon is already running")]
    DaemonAlreadyRunning,
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
}
