//! The SOCKS5-facing listener and per-user-channel relay loop (spec.md §4.2).
//!
//! Grounded on `jetsocat/src/listener.rs`'s `socks5_listener_task` for the accept-loop shape, and
//! on `crates/proxy-socks/src/socks5.rs`'s `Socks5Acceptor` (via `rproxy-socks`) for the
//! handshake itself.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use rproxy_core::idle::IdleClock;
use rproxy_core::ids::generate_user_id;
use rproxy_core::shutdown::ShutdownSignal;
use rproxy_proto::Frame;
use rproxy_socks::{AcceptError, Socks5Acceptor, Socks5FailureCode};
use slog::Logger;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

use crate::control::user_channel_handle;
use crate::registry::{Registry, UserEvent, CHANNEL_CAPACITY};

pub async fn socks_listener_task(
    listener: TcpListener,
    registry: Arc<Registry>,
    password: Arc<str>,
    logger: Logger,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "SOCKS5 listener closing for shutdown");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let password = password.clone();
                        let conn_logger = logger.new(slog::o!("peer" => peer.to_string()));
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) = run_user_channel(stream, registry, password, conn_logger.clone(), conn_shutdown).await {
                                slog::debug!(conn_logger, "user channel ended"; "error" => %err);
                            }
                        });
                    }
                    Err(err) => {
                        slog::warn!(logger, "SOCKS5 accept failed"; "error" => %err);
                    }
                }
            }
        }
    }
}

async fn run_user_channel(
    stream: TcpStream,
    registry: Arc<Registry>,
    password: Arc<str>,
    logger: Logger,
    mut shutdown: ShutdownSignal,
) -> io::Result<()> {
    let verify = {
        let registry = registry.clone();
        let password = password.clone();
        move |client_key: &str, candidate: &str| candidate == password.as_ref() && registry.contains(client_key)
    };

    let acceptor = match Socks5Acceptor::accept(stream, verify).await {
        Ok(acceptor) => acceptor,
        Err(AcceptError::Io(err)) => return Err(err),
        Err(other) => {
            slog::debug!(logger, "SOCKS5 handshake rejected"; "reason" => %other);
            return Ok(());
        }
    };

    let client_key = acceptor.client_key().to_owned();
    let Some(control) = registry.get(&client_key) else {
        // Lost the race: the control channel disconnected between the password check above and
        // here. Reply failure rather than leaving the user hanging.
        acceptor.failed(Socks5FailureCode::GeneralSocksServerFailure).await?;
        return Ok(());
    };

    let user_id = generate_user_id(12);
    let (user_handle, mut from_data) = user_channel_handle(CHANNEL_CAPACITY);

    {
        let mut users = control.users.lock().await;
        users.insert(user_id.clone(), user_handle);
    }

    let connect_uri = format!("{}:{}", user_id, acceptor.dest_addr());
    if control.to_control.send(Frame::new(rproxy_proto::FrameType::Connect, connect_uri, Bytes::new())).await.is_err() {
        control.users.lock().await.remove(&user_id);
        acceptor.failed(Socks5FailureCode::GeneralSocksServerFailure).await?;
        return Ok(());
    }

    // §5: the auth-success reply is written only after the (userId -> userChannel) registration
    // above is already observable, so no TRANSFER can race ahead of this write.
    let stream = acceptor.connected().await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let logger = logger.new(slog::o!("user_id" => user_id.clone(), "client_key" => client_key.clone()));
    slog::info!(logger, "user channel ready, awaiting data-channel bind");

    let mut idle = IdleClock::server_side();
    let mut to_data: Option<tokio::sync::mpsc::Sender<Frame>> = None;
    let mut read_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "user channel closing for shutdown");
                break;
            }
            _ = tokio::time::sleep_until(idle.read_deadline()) => {
                slog::warn!(logger, "user channel read-idle timeout");
                break;
            }
            // Only poll the socket once a data channel is bound; before that the tunnel isn't
            // up yet and reads stay paused (spec.md §4.2/§5).
            n = read_half.read(&mut read_buf), if to_data.is_some() => {
                match n {
                    Ok(0) => {
                        if let Some(tx) = &to_data {
                            let _ = tx.send(Frame::disconnect(user_id.clone())).await;
                        }
                        break;
                    }
                    Ok(n) => {
                        idle.touch_read();
                        if let Some(tx) = &to_data {
                            if tx.send(Frame::transfer(user_id.clone(), Bytes::copy_from_slice(&read_buf[..n]))).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        slog::debug!(logger, "user socket read error"; "error" => %err);
                        if let Some(tx) = &to_data {
                            let _ = tx.send(Frame::disconnect(user_id.clone())).await;
                        }
                        break;
                    }
                }
            }
            event = from_data.recv() => {
                match event {
                    Some(UserEvent::Bind(tx)) => {
                        slog::debug!(logger, "user channel bound to data channel");
                        to_data = Some(tx);
                    }
                    Some(UserEvent::Unbind) => {
                        to_data = None;
                        break;
                    }
                    Some(UserEvent::Data(bytes)) => {
                        idle.touch_write();
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(UserEvent::Close) | None => break,
                }
            }
        }
    }

    control.users.lock().await.remove(&user_id);
    slog::info!(logger, "user channel closed");
    Ok(())
}
