use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::rtun::{admin, config, logging, net, telemetry, tunnel};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let server_enabled = cfg.server.is_some();
    let client_enabled = cfg.client.is_some();
    if !server_enabled && !client_enabled {
        anyhow::bail!("config: nothing to run (set [server] and/or [client])");
    }
    let admin_enabled = !cfg.admin_addr.trim().is_empty();

    tracing::info!(
        config = %resolved.path.display(),
        server_enabled,
        client_enabled,
        admin_addr = %cfg.admin_addr,
        wait_timeout = %humantime::format_duration(cfg.tunnel.wait_timeout),
        "rtun: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let manager = Arc::new(tunnel::manager::Manager::new());
    let tunnel_opts = cfg.tunnel.options();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let state = admin::AdminState {
            prom: Some(prom.clone()),
            tunnels: manager.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Tunnel server.
    if let Some(sc) = &cfg.server {
        let server = tunnel::server::Server::new(tunnel::server::ServerOptions {
            listen_addr: sc.listen_addr.clone(),
            auth: Arc::new(tunnel::server::StaticCredentials {
                username: sc.username.clone(),
                password: sc.password.clone(),
            }),
            dial: sc.dial.clone(),
            tunnel: tunnel_opts.clone(),
            manager: manager.clone(),
        });
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    // Tunnel client.
    if let Some(cc) = &cfg.client {
        let client = tunnel::client::Client::new(tunnel::client::ClientOptions {
            server_addr: cc.server_addr.clone(),
            key: cc.key.clone(),
            username: cc.username.clone(),
            password: cc.password.clone(),
            listen: cc.listen.clone(),
            backend: cc.backend.clone(),
            dial_timeout: cc.dial_timeout,
            tunnel: tunnel_opts.clone(),
        })?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
            let _ = shutdown_tx.send(true);
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
