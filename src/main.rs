use dynapm::admin::{AdminServer, PKG_NAME, VERSION};
use dynapm::config::Config;
use dynapm::gateway::Gateway;
use dynapm::proxy::ProxyListener;
use dynapm::reaper;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dynapm=info".parse().expect("valid log directive")),
        )
        .init();

    // Task panics are logged and never take the process down
    install_panic_hook();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dynapm.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Gateway::from_config(&config)?;

    // Main hostname-routed listener
    let main_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            error!(host = %config.host, port = config.port, error = %e, "invalid bind address");
            anyhow::anyhow!("invalid bind address: {}", e)
        })?;
    let main_listener =
        ProxyListener::bind(main_addr, Arc::clone(&gateway), None, shutdown_rx.clone()).await?;

    let mut listener_handles = Vec::new();
    listener_handles.push(tokio::spawn(async move {
        if let Err(e) = main_listener.run().await {
            error!(error = %e, "main listener error");
        }
    }));

    // One dedicated listener per port-bound route
    let port_routes: Vec<_> = gateway
        .router
        .port_routes()
        .map(|(port, route)| (port, route.clone()))
        .collect();
    for (port, route) in port_routes {
        let addr: SocketAddr = format!("{}:{}", config.host, port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address for port {}: {}", port, e))?;
        let listener = ProxyListener::bind(
            addr,
            Arc::clone(&gateway),
            Some(route),
            shutdown_rx.clone(),
        )
        .await?;
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(port, error = %e, "port listener error");
            }
        }));
    }

    // Optional admin listener
    let admin_handle = if config.admin.enabled {
        let admin_addr: SocketAddr = format!("{}:{}", config.admin.host, config.admin.port)
            .parse()
            .map_err(|e| {
                error!(port = config.admin.port, error = %e, "invalid admin bind address");
                anyhow::anyhow!("invalid admin bind address: {}", e)
            })?;
        let admin_server = AdminServer::bind(
            admin_addr,
            Arc::clone(&gateway),
            config.admin.auth_token.clone(),
            &config.admin.allowed_ips,
            shutdown_rx.clone(),
        )
        .await?;
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "admin server error");
            }
        }))
    } else {
        None
    };

    // Idle reaper
    let reaper_gateway = Arc::clone(&gateway);
    let reaper_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        reaper::run(reaper_gateway, reaper_shutdown).await;
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down");
    }

    let _ = shutdown_tx.send(true);

    // Stop every service that is online or starting, best-effort
    info!("stopping all services");
    gateway.manager.stop_all(gateway.services.values()).await;

    // Wait for listeners to wind down (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in listener_handles {
            let _ = handle.await;
        }
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove PID file");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "panic caught");
        default_hook(info);
    }));
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "starting gateway");
    info!(
        host = %config.host,
        port = config.port,
        admin_enabled = config.admin.enabled,
        admin_port = if config.admin.enabled { Some(config.admin.port) } else { None },
        "listener configuration"
    );
    info!(
        pool_max_idle = config.pool.max_idle_per_host,
        pool_idle_timeout_secs = config.pool.idle_timeout_secs,
        max_body_bytes = config.max_body_bytes,
        verify_upstream_tls = config.verify_upstream_tls,
        "proxy settings"
    );
    info!(
        service_count = config.services.len(),
        services = ?config.services.keys().collect::<Vec<_>>(),
        "configured services"
    );
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Exclusive non-blocking lock; a second instance fails fast
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}
