//! Reverse SOCKS5 proxy server: accepts client control/data channels on `server.bind:server.port`
//! and external SOCKS5 users on `config.socks.bind:config.socks.port`.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use rproxy_core::config::{Properties, ServerConfig};
use rproxy_core::shutdown::{ChildTask, ShutdownHandle};
use rproxy_server::registry::Registry;
use rproxy_server::{control, socks};
use tokio::net::TcpListener;

fn parse_args() -> Result<String> {
    let mut args = std::env::args().skip(1);
    let mut config_path = "rproxy-server.properties".to_owned();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = args.next().context("--config requires a path")?;
            }
            other => anyhow::bail!("unrecognized argument `{other}`"),
        }
    }

    Ok(config_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = parse_args()?;
    let logger = rproxy_core::logging::init(None).context("initializing logger")?;

    let props = Properties::load(&config_path).unwrap_or_else(|err| {
        slog::warn!(logger, "no config file loaded, using defaults"; "path" => %config_path, "error" => %err);
        Properties::parse("")
    });
    let config = ServerConfig::from_properties(&props).context("loading server config")?;

    let registry = Arc::new(Registry::new());
    let password: Arc<str> = Arc::from(config.socks_password.as_str());

    let control_addr = format!("{}:{}", config.bind, config.port);
    let control_listener = TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("binding control listener on {control_addr}"))?;
    slog::info!(logger, "control listener bound"; "addr" => %control_addr);

    let socks_addr = format!("{}:{}", config.socks_bind, config.socks_port);
    let socks_listener = TcpListener::bind(&socks_addr)
        .await
        .with_context(|| format!("binding SOCKS5 listener on {socks_addr}"))?;
    slog::info!(logger, "SOCKS5 listener bound"; "addr" => %socks_addr);

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let control_task = {
        let registry = registry.clone();
        let logger = logger.new(slog::o!("role" => "control-listener"));
        let mut shutdown = shutdown_signal.clone();
        ChildTask::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        slog::info!(logger, "control listener closing for shutdown");
                        return;
                    }
                    accepted = control_listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let registry = registry.clone();
                                let conn_logger = logger.new(slog::o!("peer" => peer.to_string()));
                                tokio::spawn(control::handle_inbound(stream, registry, conn_logger, shutdown.clone()));
                            }
                            Err(err) => slog::warn!(logger, "control accept failed"; "error" => %err),
                        }
                    }
                }
            }
        })
    };

    let socks_task = {
        let logger = logger.new(slog::o!("role" => "socks-listener"));
        ChildTask::spawn(socks::socks_listener_task(socks_listener, registry.clone(), password, logger, shutdown_signal.clone()))
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            slog::info!(logger, "received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            slog::info!(logger, "received SIGTERM, shutting down");
        }
    }

    drop(shutdown_signal);
    shutdown_handle.signal();
    shutdown_handle.all_closed().await;
    slog::info!(logger, "all connections closed, exiting");

    drop(control_task);
    drop(socks_task);
    Ok(())
}
