use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{error, info};
use syrinx_daemon::config::Config;
use syrinx_daemon::error::{IoContext, ServerError};
use syrinx_daemon::peer::decide_trust;
use syrinx_daemon::store::MemoryStore;
use syrinx_protocol::server::{DaemonServer, ServerConfig, TrustLevel};
use tokio::net::UnixListener;
use tokio::signal;

/// File descriptor handed over by a socket-activating supervisor.
const ACTIVATION_FD: RawFd = 3;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::init();

    let config = match std::env::var("SYRINX_DAEMON_CONFIG") {
        Ok(path) => Config::from_file(&PathBuf::from(path))?,
        Err(_) => Config::default(),
    };
    let stdio_mode = std::env::args().any(|arg| arg == "--stdio");

    info!("starting syrinx-daemon");
    info!("store directory: {}", config.store_dir.display());

    let store_dir = config.store_dir()?;
    let server_config = ServerConfig {
        store_dir: store_dir.clone(),
        substituters: config.substituters.clone(),
        trusted_substituters: config.trusted_substituters.clone(),
        ..Default::default()
    };
    let store = MemoryStore::new(store_dir);
    let server = DaemonServer::new(store, server_config);
    let interrupt = server.interrupt_flag();

    if stdio_mode {
        let trust = if config.stdio_trusted {
            TrustLevel::Trusted
        } else {
            TrustLevel::NotTrusted
        };
        return server
            .serve_io(tokio::io::stdin(), tokio::io::stdout(), trust)
            .await
            .map_err(ServerError::from);
    }

    let listener = bind_listener(&config)?;
    info!("listening on {}", config.socket_path.display());

    let accept_config = config.clone();
    let policy = Arc::new(move |peer: &tokio::net::unix::UCred| {
        decide_trust(&accept_config, peer)
    });

    tokio::select! {
        result = server.serve(listener, policy) => {
            if let Err(e) = result {
                error!("server error: {e}");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            interrupt.store(true, Ordering::Relaxed);
        }
    }

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path).io_context(|| {
            format!(
                "Failed to remove socket file at {}",
                config.socket_path.display()
            )
        })?;
    }

    info!("syrinx-daemon stopped");
    Ok(())
}

/// Bind the daemon socket, honoring a supervisor-provided listening fd
/// when one was inherited.
fn bind_listener(config: &Config) -> Result<UnixListener, ServerError> {
    if let Ok(count) = std::env::var("LISTEN_FDS") {
        let pid_matches = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|pid| pid.parse::<u32>().ok())
            .is_none_or(|pid| pid == std::process::id());
        if pid_matches && count.parse::<u32>().unwrap_or(0) >= 1 {
            info!("using socket-activated listener");
            // The supervisor guarantees fd 3 is ours and open.
            #[allow(unsafe_code)]
            let fd = unsafe { OwnedFd::from_raw_fd(ACTIVATION_FD) };
            let std_listener = std::os::unix::net::UnixListener::from(fd);
            std_listener
                .set_nonblocking(true)
                .io_context(|| "Failed to configure inherited listener".to_owned())?;
            return UnixListener::from_std(std_listener)
                .io_context(|| "Failed to adopt inherited listener".to_owned());
        }
    }

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path).io_context(|| {
            format!(
                "Failed to remove stale socket at {}",
                config.socket_path.display()
            )
        })?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent).io_context(|| {
            format!("Failed to create socket directory {}", parent.display())
        })?;
    }
    let listener = UnixListener::bind(&config.socket_path).io_context(|| {
        format!("Failed to bind socket at {}", config.socket_path.display())
    })?;
    // World-accessible; the directory and the allowed-users list gate
    // access.
    let permissions = std::os::unix::fs::PermissionsExt::from_mode(0o666);
    std::fs::set_permissions(&config.socket_path, permissions).io_context(|| {
        format!(
            "Failed to set permissions on {}",
            config.socket_path.display()
        )
    })?;
    Ok(listener)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
