use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::HerdError;
use crate::logging::LogSink;
use crate::server::{now_epoch_secs, HerdEvent, ServerConfig, Stack};
use crate::storage::{save_configs, PersistedConfigs};
use crate::supervisor::{spawn_actor, ActorContext, RuntimeTable, ServerHandle, SupervisorSettings};

pub enum RegistryCommand {
    Add {
        config: ServerConfig,
        reply: oneshot::Sender<Result<ServerHandle>>,
    },
    Lookup {
        name: String,
        reply: oneshot::Sender<Result<ServerHandle>>,
    },
    Get {
        name: String,
        reply: oneshot::Sender<Result<ServerConfig>>,
    },
    /// Sent by an actor once it accepted a new config for its server.
    Commit {
        config: ServerConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Forget {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<ServerConfig>>,
    },
    Handles {
        reply: oneshot::Sender<Vec<ServerHandle>>,
    },
    AddStack {
        stack: Stack,
        reply: oneshot::Sender<Result<Stack>>,
    },
    UpdateStack {
        stack: Stack,
        reply: oneshot::Sender<Result<Stack>>,
    },
    RemoveStack {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ListStacks {
        reply: oneshot::Sender<Vec<Stack>>,
    },
    StackMembers {
        name: String,
        reply: oneshot::Sender<Result<Vec<ServerHandle>>>,
    },
    Save {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Client side of the registry loop.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    pub async fn add(&self, config: ServerConfig) -> Result<ServerHandle> {
        self.request(|reply| RegistryCommand::Add { config, reply })
            .await?
    }

    pub async fn lookup(&self, name: &str) -> Result<ServerHandle> {
        let name = name.to_string();
        self.request(|reply| RegistryCommand::Lookup { name, reply })
            .await?
    }

    pub async fn get(&self, name: &str) -> Result<ServerConfig> {
        let name = name.to_string();
        self.request(|reply| RegistryCommand::Get { name, reply })
            .await?
    }

    pub async fn forget(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| RegistryCommand::Forget { name, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<ServerConfig>> {
        self.request(|reply| RegistryCommand::List { reply }).await
    }

    pub async fn handles(&self) -> Result<Vec<ServerHandle>> {
        self.request(|reply| RegistryCommand::Handles { reply }).await
    }

    pub async fn add_stack(&self, stack: Stack) -> Result<Stack> {
        self.request(|reply| RegistryCommand::AddStack { stack, reply })
            .await?
    }

    pub async fn update_stack(&self, stack: Stack) -> Result<Stack> {
        self.request(|reply| RegistryCommand::UpdateStack { stack, reply })
            .await?
    }

    pub async fn remove_stack(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| RegistryCommand::RemoveStack { name, reply })
            .await?
    }

    pub async fn list_stacks(&self) -> Result<Vec<Stack>> {
        self.request(|reply| RegistryCommand::ListStacks { reply })
            .await
    }

    pub async fn stack_members(&self, name: &str) -> Result<Vec<ServerHandle>> {
        let name = name.to_string();
        self.request(|reply| RegistryCommand::StackMembers { name, reply })
            .await?
    }

    pub async fn save(&self) -> Result<()> {
        self.request(|reply| RegistryCommand::Save { reply }).await?
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| HerdError::Unavailable("registry"))?;
        Ok(reply_rx
            .await
            .map_err(|_| HerdError::Unavailable("registry"))?)
    }
}

struct Entry {
    config: ServerConfig,
    handle: ServerHandle,
}

struct Registry {
    config_path: PathBuf,
    entries: Vec<Entry>,
    stacks: Vec<Stack>,
    ctx: ActorContext,
}

/// Spawns the registry loop and one supervisor actor per persisted server.
pub fn spawn_registry(
    config_path: PathBuf,
    initial: PersistedConfigs,
    table: RuntimeTable,
    events: broadcast::Sender<HerdEvent>,
    sink: LogSink,
    settings: SupervisorSettings,
) -> RegistryHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = ActorContext {
        table,
        events,
        sink,
        registry: tx.clone(),
        settings,
    };

    let mut registry = Registry {
        config_path,
        entries: Vec::new(),
        stacks: Vec::new(),
        ctx,
    };
    for config in initial.servers {
        if let Err(err) = registry.validate_new(&config) {
            warn!("skipping persisted server {:?}: {err:#}", config.name);
            continue;
        }
        registry.insert(config);
    }
    for mut stack in initial.stacks {
        if validate_name(&stack.name).is_err() || registry.stack_index(&stack.name).is_some() {
            warn!("skipping persisted stack {:?}", stack.name);
            continue;
        }
        stack
            .servers
            .retain(|member| registry.index(member).is_some());
        registry.stacks.push(stack);
    }
    info!(
        "loaded {} server(s) and {} stack(s)",
        registry.entries.len(),
        registry.stacks.len()
    );

    tokio::spawn(registry.run(rx));
    RegistryHandle { tx }
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistryCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("registry loop closed");
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Add { mut config, reply } => {
                let result = self.validate_new(&config).map(|_| {
                    if config.created_at == 0 {
                        config.created_at = now_epoch_secs();
                    }
                    info!("added server {}", config.name);
                    let handle = self.insert(config);
                    self.persist();
                    handle
                });
                let _ = reply.send(result);
            }
            RegistryCommand::Lookup { name, reply } => {
                let result = self
                    .index(&name)
                    .map(|idx| self.entries[idx].handle.clone())
                    .ok_or_else(|| HerdError::NotFound(name).into());
                let _ = reply.send(result);
            }
            RegistryCommand::Get { name, reply } => {
                let result = self
                    .index(&name)
                    .map(|idx| self.entries[idx].config.clone())
                    .ok_or_else(|| HerdError::NotFound(name).into());
                let _ = reply.send(result);
            }
            RegistryCommand::Commit { config, reply } => {
                let result = match self.index(&config.name) {
                    Some(idx) => {
                        self.entries[idx].config = config;
                        self.persist();
                        Ok(())
                    }
                    None => Err(HerdError::NotFound(config.name).into()),
                };
                let _ = reply.send(result);
            }
            RegistryCommand::Forget { name, reply } => {
                let result = match self.index(&name) {
                    Some(idx) => {
                        self.entries.remove(idx);
                        for stack in &mut self.stacks {
                            stack.servers.retain(|member| member != &name);
                        }
                        info!("removed server {name}");
                        self.persist();
                        Ok(())
                    }
                    None => Err(HerdError::NotFound(name).into()),
                };
                let _ = reply.send(result);
            }
            RegistryCommand::List { reply } => {
                let _ = reply.send(
                    self.entries
                        .iter()
                        .map(|entry| entry.config.clone())
                        .collect(),
                );
            }
            RegistryCommand::Handles { reply } => {
                let _ = reply.send(
                    self.entries
                        .iter()
                        .map(|entry| entry.handle.clone())
                        .collect(),
                );
            }
            RegistryCommand::AddStack { stack, reply } => {
                let result = self.add_stack(stack);
                let _ = reply.send(result);
            }
            RegistryCommand::UpdateStack { stack, reply } => {
                let result = self.update_stack(stack);
                let _ = reply.send(result);
            }
            RegistryCommand::RemoveStack { name, reply } => {
                let result = match self.stack_index(&name) {
                    Some(idx) => {
                        self.stacks.remove(idx);
                        self.persist();
                        Ok(())
                    }
                    None => Err(HerdError::StackNotFound(name).into()),
                };
                let _ = reply.send(result);
            }
            RegistryCommand::ListStacks { reply } => {
                let _ = reply.send(self.stacks.clone());
            }
            RegistryCommand::StackMembers { name, reply } => {
                let result = match self.stack_index(&name) {
                    Some(idx) => Ok(self.stacks[idx]
                        .servers
                        .iter()
                        .filter_map(|member| self.index(member))
                        .map(|idx| self.entries[idx].handle.clone())
                        .collect()),
                    None => Err(HerdError::StackNotFound(name).into()),
                };
                let _ = reply.send(result);
            }
            RegistryCommand::Save { reply } => {
                let _ = reply.send(save_configs(&self.config_path, &self.snapshot()));
            }
        }
    }

    fn validate_new(&self, config: &ServerConfig) -> Result<()> {
        validate_name(&config.name)?;
        if config.command.trim().is_empty() {
            return Err(HerdError::InvalidCommand("command cannot be empty".to_string()).into());
        }
        if self.index(&config.name).is_some() {
            return Err(HerdError::DuplicateName(config.name.clone()).into());
        }
        Ok(())
    }

    fn insert(&mut self, config: ServerConfig) -> ServerHandle {
        let handle = spawn_actor(config.clone(), self.ctx.clone());
        self.entries.push(Entry {
            config,
            handle: handle.clone(),
        });
        handle
    }

    fn add_stack(&mut self, stack: Stack) -> Result<Stack> {
        validate_name(&stack.name)?;
        if self.stack_index(&stack.name).is_some() {
            return Err(HerdError::DuplicateStack(stack.name).into());
        }
        let stack = self.checked_members(stack)?;
        self.stacks.push(stack.clone());
        self.persist();
        Ok(stack)
    }

    fn update_stack(&mut self, stack: Stack) -> Result<Stack> {
        let Some(idx) = self.stack_index(&stack.name) else {
            return Err(HerdError::StackNotFound(stack.name).into());
        };
        let stack = self.checked_members(stack)?;
        self.stacks[idx] = stack.clone();
        self.persist();
        Ok(stack)
    }

    /// Rejects unknown members and drops repeated ones, keeping first occurrence order.
    fn checked_members(&self, mut stack: Stack) -> Result<Stack> {
        let mut members: Vec<String> = Vec::with_capacity(stack.servers.len());
        for member in stack.servers {
            if self.index(&member).is_none() {
                return Err(HerdError::NotFound(member).into());
            }
            if !members.contains(&member) {
                members.push(member);
            }
        }
        stack.servers = members;
        Ok(stack)
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.config.name == name)
    }

    fn stack_index(&self, name: &str) -> Option<usize> {
        self.stacks.iter().position(|stack| stack.name == name)
    }

    fn snapshot(&self) -> PersistedConfigs {
        PersistedConfigs {
            servers: self
                .entries
                .iter()
                .map(|entry| entry.config.clone())
                .collect(),
            stacks: self.stacks.clone(),
        }
    }

    fn persist(&self) {
        if let Err(err) = save_configs(&self.config_path, &self.snapshot()) {
            warn!("failed to persist server configs: {err:#}");
        }
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HerdError::InvalidName("name cannot be empty".to_string()).into());
    }

    let valid = name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.');
    if !valid || name.starts_with('.') {
        return Err(HerdError::InvalidName(name.to_string()).into());
    }
    Ok(())
}
