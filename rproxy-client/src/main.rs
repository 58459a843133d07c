//! Reverse SOCKS5 proxy client: dials out to a server's control-channel listener and egresses
//! tunneled traffic into this process's private network.

use anyhow::{Context as _, Result};
use rproxy_client::control;
use rproxy_core::config::{ClientConfig, Properties};
use rproxy_core::shutdown::{ChildTask, ShutdownHandle};

enum Action {
    Run { config_path: String },
    GenerateKey,
}

fn parse_args() -> Result<Action> {
    let mut args = std::env::args().skip(1);
    let mut config_path = "rproxy-client.properties".to_owned();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = args.next().context("--config requires a path")?;
            }
            "--generate-key" => return Ok(Action::GenerateKey),
            other => anyhow::bail!("unrecognized argument `{other}`"),
        }
    }

    Ok(Action::Run { config_path })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = match parse_args()? {
        // Provisioning helper: print a fresh clientKey for a new `rproxy-client.properties` and
        // exit, rather than dialing anything (spec.md §4.2, the `ZC-` key a SOCKS5 user presents
        // as a username to reach this client's private network).
        Action::GenerateKey => {
            println!("{}", rproxy_core::ids::generate_client_key());
            return Ok(());
        }
        Action::Run { config_path } => config_path,
    };
    let logger = rproxy_core::logging::init(None).context("initializing logger")?;

    let props = Properties::load(&config_path).unwrap_or_else(|err| {
        slog::warn!(logger, "no config file loaded, using defaults"; "path" => %config_path, "error" => %err);
        Properties::parse("")
    });
    let config = ClientConfig::from_properties(&props).context("loading client config")?;

    let server_addr = format!("{}:{}", config.server_host, config.server_port);
    let control_logger = logger.new(slog::o!("role" => "control"));

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let control_task = ChildTask::spawn(control::run(server_addr, config.client_key.clone(), control_logger, shutdown_signal.clone()));

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
    Ok(())
}
