use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use libdevmux::{
    ExecutePolicy, ManagerConfig, PtyEngine, PtyEngineConfig, ReadOnlyUids, TerminalManager,
    VirtualPathSandbox,
};

use crate::config::AgentConfig;
use crate::connection;

pub async fn run(config: AgentConfig) -> Result<()> {
    let sandbox_root = fs::canonicalize(&config.sandbox_root).with_context(|| {
        format!(
            "sandbox root {} is not accessible",
            config.sandbox_root.display()
        )
    })?;
    if !sandbox_root.is_dir() {
        return Err(anyhow!(
            "sandbox root {} is not a directory",
            sandbox_root.display()
        ));
    }

    // Installed before the socket appears so an early SIGTERM still cleans up.
    let terminate = signal(SignalKind::terminate())?;

    if let Some(parent) = config.pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config.pid_file, std::process::id().to_string())?;

    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale_socket(&config.socket_path)?;

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600))?;

    info!(
        pid = std::process::id(),
        socket = %config.socket_path.display(),
        sandbox_root = %sandbox_root.display(),
        "devmux agent started"
    );

    let engine = Arc::new(PtyEngine::new(PtyEngineConfig {
        shell: config.shell.clone(),
        shell_args: config.shell_args.clone(),
        scrollback_chunks: config.scrollback_chunks,
        ..PtyEngineConfig::default()
    }));
    let policy: Arc<dyn ExecutePolicy> =
        Arc::new(ReadOnlyUids::new(config.read_only_uids.iter().copied()));
    let manager = Arc::new(TerminalManager::new(
        engine,
        VirtualPathSandbox::new(&sandbox_root),
        policy,
        ManagerConfig {
            sink_capacity: config.sink_capacity,
        },
    ));

    let result = accept_loop(listener, manager, &config, terminate).await;

    let _ = fs::remove_file(&config.socket_path);
    let _ = fs::remove_file(&config.pid_file);
    info!("devmux agent stopped");
    result
}

async fn accept_loop(
    listener: UnixListener,
    manager: Arc<TerminalManager>,
    config: &AgentConfig,
    mut terminate: Signal,
) -> Result<()> {
    let allowed_uid = Uid::effective().as_raw();
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping accept loop");
                break;
            }
            _ = terminate.recv() => {
                info!("terminate received, stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                let peer_uid = match verify_peer_uid(&stream, allowed_uid) {
                    Ok(uid) => uid,
                    Err(err) => {
                        warn!("rejected peer: {err}");
                        continue;
                    }
                };

                connections.retain(|handle| !handle.is_finished());
                connections.push(tokio::spawn(connection::handle_connection(
                    stream,
                    peer_uid,
                    Arc::clone(&manager),
                    config.outbound_queue,
                )));
            }
        }
    }

    debug!(open = connections.len(), "aborting client connections");
    for handle in connections {
        handle.abort();
    }
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<u32> {
    let creds = stream
        .peer_cred()
        .context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!(
            "peer uid {uid} is not allowed (expected {expected_uid})"
        ));
    }
    Ok(uid)
}
