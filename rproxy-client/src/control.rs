//! The client's persistent control channel: dials the server, sends AUTH, and dispatches
//! CONNECT instructions into real-server dials + pooled data channels (spec.md §4.4).
//!
//! Grounded on `jmux-proxy/src/lib.rs`'s reconnect-oriented task structure for the dial/backoff
//! loop shape, generalized from jmux's single multiplexed pipe to this protocol's separate
//! control + data sockets.

use std::sync::Arc;

use futures_util::{SinkExt as _, StreamExt as _};
use rproxy_core::idle::IdleClock;
use rproxy_core::shutdown::ShutdownSignal;
use rproxy_proto::{Frame, FrameCodec, FrameType};
use slog::Logger;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::backoff::Backoff;
use crate::pool::{BindRequest, Pool};
use crate::realserver::{self, RealServerEvent};
use crate::CHANNEL_CAPACITY;

/// Runs the control channel for the lifetime of the process: connect, authenticate, relay
/// CONNECT/DISCONNECT/HEARTBEAT until the connection drops, then reconnect with backoff
/// (spec.md §4.7). All data-channel and real-server sockets are owned per-connect-cycle, so a
/// dropped control channel implicitly tears them down when this loop's iteration ends.
pub async fn run(server_addr: String, client_key: String, logger: Logger, mut shutdown: ShutdownSignal) {
    let mut backoff = Backoff::new();

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "control channel shutting down");
                return;
            }
            result = connect_and_serve(&server_addr, &client_key, &logger, &mut backoff, shutdown.clone()) => {
                match result {
                    Ok(()) => slog::info!(logger, "control channel closed, reconnecting"),
                    Err(err) => slog::warn!(logger, "control channel failed, reconnecting"; "error" => %err),
                }
            }
        }

        let delay = backoff.next_delay();
        slog::info!(logger, "waiting before reconnecting"; "delay_secs" => delay.as_secs());
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_and_serve(
    server_addr: &str,
    client_key: &str,
    logger: &Logger,
    backoff: &mut Backoff,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(server_addr).await?;
    let mut framed = Framed::new(stream, FrameCodec::control());
    framed.send(Frame::auth(client_key.to_owned())).await.map_err(std::io::Error::other)?;
    backoff.reset();

    slog::info!(logger, "control channel connected and authenticated"; "client_key" => %client_key);

    let pool = Pool::new(server_addr.to_owned(), logger.new(slog::o!("role" => "pool")), shutdown.clone());
    let mut idle = IdleClock::client_side();

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "control channel closing for shutdown");
                return Ok(());
            }
            _ = tokio::time::sleep_until(idle.read_deadline()) => {
                slog::warn!(logger, "control channel read-idle timeout");
                return Ok(());
            }
            _ = tokio::time::sleep_until(idle.write_deadline()) => {
                framed.send(Frame::heartbeat(0)).await.map_err(std::io::Error::other)?;
                idle.touch_write();
            }
            maybe_frame = framed.next() => {
                let frame = match maybe_frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => return Err(std::io::Error::other(err)),
                    None => return Ok(()),
                };
                idle.touch_read();

                match frame.ty {
                    // The server only ever echoes a heartbeat this client itself sent on
                    // write-idle above; nothing to send back here (spec.md §4.4/§4.6).
                    FrameType::Heartbeat => {}
                    FrameType::Connect => {
                        handle_connect(frame.uri, client_key.to_owned(), pool.clone(), &mut framed, logger).await?;
                        idle.touch_write();
                    }
                    other => {
                        slog::warn!(logger, "unexpected frame type on control channel, closing"; "type" => ?other);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// `uri = "userId:ip:port"`: dial the target, borrow a pooled data channel, cross-bind them.
/// On dial or borrow failure, report back with DISCONNECT on the control channel itself — the
/// one case where that frame travels on the control leg, since no data channel exists yet for
/// this flow (spec.md §4.4).
async fn handle_connect(
    uri: String,
    client_key: String,
    pool: Arc<Pool>,
    control: &mut Framed<TcpStream, FrameCodec>,
    logger: &Logger,
) -> std::io::Result<()> {
    let Some((user_id, target)) = uri.split_once(':') else {
        slog::warn!(logger, "malformed CONNECT uri"; "uri" => %uri);
        return Ok(());
    };
    let user_id = user_id.to_owned();
    let target = target.to_owned();

    let logger = logger.new(slog::o!("user_id" => user_id.clone(), "target" => target.clone()));

    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            slog::warn!(logger, "dial to real server failed"; "error" => %err);
            control.send(Frame::disconnect(user_id)).await.map_err(std::io::Error::other)?;
            return Ok(());
        }
    };

    let (to_realserver_tx, to_realserver_rx) = mpsc::channel::<RealServerEvent>(CHANNEL_CAPACITY);
    let (to_data_tx, to_data_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

    let request = BindRequest {
        user_id: user_id.clone(),
        client_key,
        to_realserver: to_realserver_tx,
        from_realserver: to_data_rx,
    };

    if let Err(err) = pool.borrow(request).await {
        slog::warn!(logger, "borrowing a data channel failed"; "error" => %err);
        control.send(Frame::disconnect(user_id)).await.map_err(std::io::Error::other)?;
        return Ok(());
    }

    tokio::spawn(realserver::run_real_server_channel(
        stream,
        user_id,
        to_data_tx,
        to_realserver_rx,
        logger.clone(),
        pool.shutdown(),
    ));

    Ok(())
}
