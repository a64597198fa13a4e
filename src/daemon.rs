use std::env;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::engine::Herd;
use crate::errors::HerdError;
use crate::ipc::{read_json_line, write_json_line, IpcRequest, IpcResponse};
use crate::server::ServerView;

pub async fn run_foreground(config: AppConfig) -> Result<()> {
    config.ensure_layout()?;
    let listener = bind_listener(&config.daemon_addr).await?;
    let herd = Herd::open(&config).await?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

    info!("nodeherd daemon started at {}", config.daemon_addr);

    loop {
        tokio::select! {
            incoming = listener.accept() => {
                match incoming {
                    Ok((stream, _)) => {
                        let herd = herd.clone();
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, herd, shutdown_tx).await {
                                error!("failed to handle IPC client: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("IPC accept failed: {err}");
                    }
                }
            }
            Some(_) = shutdown_rx.recv() => {
                info!("shutdown requested via IPC; stopping managed servers");
                break;
            }
            ctrl = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl {
                    warn!("failed to wait for CTRL-C signal: {err}");
                }
                info!("received shutdown signal; stopping managed servers");
                break;
            }
        }
    }

    drop(listener);
    herd.shutdown().await
}

pub async fn ensure_daemon_running(config: &AppConfig) -> Result<()> {
    if daemon_socket_available(&config.daemon_addr).await {
        return Ok(());
    }

    let executable = env::current_exe().context("failed to locate current executable")?;
    Command::new(executable)
        .arg("daemon")
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn daemon")?;

    for _ in 0..50 {
        if daemon_socket_available(&config.daemon_addr).await {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("daemon did not become ready in time")
}

pub async fn daemon_socket_available(daemon_addr: &str) -> bool {
    match timeout(Duration::from_millis(250), TcpStream::connect(daemon_addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

async fn bind_listener(daemon_addr: &str) -> Result<TcpListener> {
    if daemon_socket_available(daemon_addr).await {
        return Err(HerdError::DaemonAlreadyRunning.into());
    }

    TcpListener::bind(daemon_addr)
        .await
        .with_context(|| format!("failed to bind daemon endpoint at {daemon_addr}"))
}

async fn handle_client(
    mut stream: TcpStream,
    herd: Herd,
    shutdown_tx: mpsc::UnboundedSender<()>,
) -> Result<()> {
    let request = read_json_line::<IpcRequest, _>(&mut stream).await?;
    if let IpcRequest::Watch { name } = request {
        return stream_events(stream, &herd, name).await;
    }
    let response = execute_request(request, &herd, &shutdown_tx).await;
    write_json_line(&mut stream, &response).await
}

/// Forwards engine events to a watching client until it disconnects.
async fn stream_events(mut stream: TcpStream, herd: &Herd, name: Option<String>) -> Result<()> {
    if let Some(name) = name.as_deref() {
        if let Err(err) = herd.status(name).await {
            return write_json_line(&mut stream, &IpcResponse::error(err.to_string())).await;
        }
    }
    let mut events = herd.subscribe();
    write_json_line(&mut stream, &IpcResponse::ok("watching")).await?;

    let (mut reader, mut writer) = stream.split();
    let mut scratch = [0_u8; 64];
    loop {
        tokio::select! {
            read = reader.read(&mut scratch) => {
                if matches!(read, Ok(0) | Err(_)) {
                    debug!("watch client disconnected");
                    return Ok(());
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if name.as_deref().is_some_and(|name| name != event.server()) {
                        continue;
                    }
                    if write_json_line(&mut writer, &event).await.is_err() {
                        debug!("watch client went away");
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("watch client fell behind; skipped {skipped} event(s)");
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn execute_request(
    request: IpcRequest,
    herd: &Herd,
    shutdown_tx: &mpsc::UnboundedSender<()>,
) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::ok("pong"),
        IpcRequest::Shutdown => {
            let active = match herd.list_servers().await {
                Ok(views) => views
                    .iter()
                    .filter(|view| view.runtime.state.is_active())
                    .count(),
                Err(err) => {
                    warn!("could not count servers before shutdown: {err:#}");
                    0
                }
            };
            let _ = shutdown_tx.send(());
            IpcResponse::ok(format!(
                "daemon shutting down, stopping {active} active server(s)"
            ))
        }
        IpcRequest::Add { config } => {
            view_response(herd.add_server(config).await, |view| {
                format!("added {}", view.config.name)
            })
        }
        IpcRequest::Edit { name, config } => {
            view_response(herd.update_server(&name, config).await, |view| {
                format!("updated {}", view.config.name)
            })
        }
        IpcRequest::Remove { name, force } => match herd.remove_server(&name, force).await {
            Ok(()) => IpcResponse::ok(format!("removed {name}")),
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::Start { name } => view_response(herd.start(&name).await, |view| {
            format!("started {}", view.config.name)
        }),
        IpcRequest::Stop { name } => view_response(herd.stop(&name).await, |view| {
            format!("stopped {}", view.config.name)
        }),
        IpcRequest::Restart { name } => view_response(herd.restart(&name).await, |view| {
            format!("restarted {}", view.config.name)
        }),
        IpcRequest::List => match herd.list_servers().await {
            Ok(servers) => {
                let mut response = IpcResponse::ok("ok");
                response.samples = servers
                    .iter()
                    .flat_map(|view| herd.live_metrics(&view.config.name, 1))
                    .collect();
                response.servers = servers;
                response
            }
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::Status { name } => {
            let mut response = view_response(herd.status(&name).await, |_| "ok".to_string());
            if response.ok {
                response.samples = herd.live_metrics(&name, 1);
            }
            response
        }
        IpcRequest::Logs { name, lines, live } => {
            let result = if live {
                herd.status(&name)
                    .await
                    .map(|_| herd.live_logs(&name, lines))
            } else {
                herd.logs(&name, lines).await
            };
            match result {
                Ok(logs) => {
                    let mut response = IpcResponse::ok("ok");
                    response.logs = logs;
                    response
                }
                Err(err) => IpcResponse::error(err.to_string()),
            }
        }
        IpcRequest::LogsClear { name } => match herd.clear_logs(&name).await {
            Ok(()) => IpcResponse::ok(format!("cleared logs for {name}")),
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::Metrics { name, since_ms } => {
            match herd.metrics_history(&name, since_ms).await {
                Ok(samples) => {
                    let mut response = IpcResponse::ok("ok");
                    response.samples = samples;
                    response
                }
                Err(err) => IpcResponse::error(err.to_string()),
            }
        }
        IpcRequest::StackAdd { name, servers } => match herd.add_stack(&name, servers).await {
            Ok(stack) => {
                let mut response = IpcResponse::ok(format!("added stack {}", stack.name));
                response.stacks = vec![stack];
                response
            }
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::StackEdit { name, servers } => match herd.update_stack(&name, servers).await {
            Ok(stack) => {
                let mut response = IpcResponse::ok(format!("updated stack {}", stack.name));
                response.stacks = vec![stack];
                response
            }
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::StackRemove { name } => match herd.remove_stack(&name).await {
            Ok(()) => IpcResponse::ok(format!("removed stack {name}")),
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::StackList => match herd.list_stacks().await {
            Ok(stacks) => {
                let mut response = IpcResponse::ok("ok");
                response.stacks = stacks;
                response
            }
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::StackStart { name } => match herd.start_stack(&name).await {
            Ok(results) => {
                let mut response = IpcResponse::ok(format!("started stack {name}"));
                response.ok = results.iter().all(|outcome| outcome.ok);
                response.stack_results = results;
                response
            }
            Err(err) => IpcResponse::error(err.to_string()),
        },
        IpcRequest::Watch { .. } => IpcResponse::error("watch needs a dedicated connection"),
        IpcRequest::StackStop { name } => match herd.stop_stack(&name).await {
            Ok(results) => {
                let mut response = IpcResponse::ok(format!("stopped stack {name}"));
                response.ok = results.iter().all(|outcome| outcome.ok);
                response.stack_results = results;
                response
            }
            Err(err) => IpcResponse::error(err.to_string()),
        },
    }
}

fn view_response(
    result: Result<ServerView>,
    message: impl FnOnce(&ServerView) -> String,
) -> IpcResponse {
    match result {
        Ok(view) => {
            let mut response = IpcResponse::ok(message(&view));
            response.server = Some(view);
            response
        }
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    use super::{execute_request, handle_client};
    use crate::config::AppConfig;
    use crate::engine::Herd;
    use crate::ipc::{send_request, watch, IpcRequest};
    use crate::server::{HerdEvent, ServerConfig, ServerState};

    #[tokio::test]
    async fn execute_request_manages_servers_and_reports_errors() {
        let config = AppConfig::for_test("daemon-execute");
        let herd = Herd::open(&config).await.expect("open herd");
        let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();

        let response = execute_request(
            IpcRequest::Add {
                config: ServerConfig::new("api", &config.base_dir, "node", Vec::new(), Some(3000)),
            },
            &herd,
            &shutdown_tx,
        )
        .await;
        assert!(response.ok, "add failed: {}", response.message);
        assert_eq!(response.message, "added api");

        let duplicate = execute_request(
            IpcRequest::Add {
                config: ServerConfig::new("api", &config.base_dir, "node", Vec::new(), None),
            },
            &herd,
            &shutdown_tx,
        )
        .await;
        assert!(!duplicate.ok);
        assert!(duplicate.message.contains("duplicate server name"));

        let list = execute_request(IpcRequest::List, &herd, &shutdown_tx).await;
        assert_eq!(list.servers.len(), 1);
        assert_eq!(list.servers[0].runtime.state, ServerState::Stopped);

        let missing = execute_request(
            IpcRequest::Status {
                name: "ghost".to_string(),
            },
            &herd,
            &shutdown_tx,
        )
        .await;
        assert!(!missing.ok);
        assert!(missing.message.contains("server not found"));

        let stack = execute_request(
            IpcRequest::StackAdd {
                name: "dev".to_string(),
                servers: vec!["api".to_string()],
            },
            &herd,
            &shutdown_tx,
        )
        .await;
        assert!(stack.ok, "stack add failed: {}", stack.message);
        let stacks = execute_request(IpcRequest::StackList, &herd, &shutdown_tx).await;
        assert_eq!(stacks.stacks.len(), 1);

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test]
    async fn shutdown_request_signals_daemon_loop() {
        let config = AppConfig::for_test("daemon-shutdown");
        let herd = Herd::open(&config).await.expect("open herd");
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();

        herd.add_server(ServerConfig::new(
            "api",
            &config.base_dir,
            "sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            None,
        ))
        .await
        .expect("add server");
        herd.add_server(ServerConfig::new("idle", &config.base_dir, "node", Vec::new(), None))
            .await
            .expect("add idle server");
        herd.start("api").await.expect("start api");

        let response = execute_request(IpcRequest::Shutdown, &herd, &shutdown_tx).await;
        assert!(response.ok);
        assert_eq!(
            response.message,
            "daemon shutting down, stopping 1 active server(s)"
        );
        assert!(shutdown_rx.try_recv().is_ok());

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[tokio::test]
    async fn handle_client_serves_requests_over_tcp() {
        let config = AppConfig::for_test("daemon-client");
        let herd = Herd::open(&config).await.expect("open herd");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind local listener");
        let addr = listener
            .local_addr()
            .expect("failed to resolve listener addr");
        let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();

        let server = {
            let herd = herd.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.expect("accept failed");
                handle_client(stream, herd, shutdown_tx)
                    .await
                    .expect("client handling failed");
            })
        };

        let response = send_request(&addr.to_string(), &IpcRequest::Ping)
            .await
            .expect("send_request failed");
        assert!(response.ok);
        assert_eq!(response.message, "pong");
        server.await.expect("server task failed");

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn watch_streams_events_of_the_named_server_until_disconnect() {
        let config = AppConfig::for_test("daemon-watch");
        let herd = Herd::open(&config).await.expect("open herd");
        for name in ["api", "worker"] {
            herd.add_server(ServerConfig::new(
                name,
                &config.base_dir,
                "sh",
                vec!["-c".to_string(), "sleep 30".to_string()],
                None,
            ))
            .await
            .expect("add server");
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind local listener");
        let addr = listener
            .local_addr()
            .expect("failed to resolve listener addr");
        let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();
        let server = {
            let herd = herd.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.expect("accept failed");
                handle_client(stream, herd, shutdown_tx).await
            })
        };

        let mut events = watch(&addr.to_string(), Some("api".to_string()))
            .await
            .expect("watch should be accepted");
        herd.start("worker").await.expect("start worker");
        herd.start("api").await.expect("start api");

        let mut states = Vec::new();
        while !states.contains(&ServerState::Running) {
            let event = timeout(Duration::from_secs(5), events.next())
                .await
                .expect("expected an event in time")
                .expect("event stream readable")
                .expect("event stream open");
            assert_eq!(event.server(), "api");
            if let HerdEvent::Status(change) = event {
                states.push(change.to);
            }
        }
        assert_eq!(states, vec![ServerState::Starting, ServerState::Running]);

        drop(events);
        timeout(Duration::from_secs(5), server)
            .await
            .expect("stream should end once the client leaves")
            .expect("server task panicked")
            .expect("client handling failed");

        herd.shutdown().await.expect("shutdown");
        let _ = fs::remove_dir_all(&config.base_dir);
    }
}
