//! The client's real-server channel (spec.md §4.4, §4.8): one raw TCP connection into the
//! private network per active user flow, cross-bound to a data channel.
//!
//! Grounded on the relay-loop shape of `rproxy-server`'s `socks::run_user_channel`, mirrored
//! here for the opposite leg of the same bound pair.

use bytes::Bytes;
use rproxy_core::shutdown::ShutdownSignal;
use rproxy_proto::Frame;
use slog::Logger;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Delivered to a real-server channel's task by the data channel it is bound to.
pub enum RealServerEvent {
    Data(Bytes),
    Close,
}

/// Owns the socket to the target inside the private network for one user flow. `to_data` carries
/// outgoing TRANSFER/DISCONNECT frames to the bound data channel; `from_data` delivers payload
/// and close notifications arriving from the server over that same data channel.
pub async fn run_real_server_channel(
    stream: TcpStream,
    user_id: String,
    to_data: mpsc::Sender<Frame>,
    mut from_data: mpsc::Receiver<RealServerEvent>,
    logger: Logger,
    mut shutdown: ShutdownSignal,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "real-server channel closing for shutdown");
                let _ = to_data.send(Frame::disconnect(user_id.clone())).await;
                break;
            }
            n = read_half.read(&mut buf) => {
                match n {
                    Ok(0) => {
                        slog::debug!(logger, "real-server socket closed by peer");
                        let _ = to_data.send(Frame::disconnect(user_id.clone())).await;
                        break;
                    }
                    Ok(n) => {
                        if to_data.send(Frame::transfer(user_id.clone(), Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        slog::debug!(logger, "real-server socket read error"; "error" => %err);
                        let _ = to_data.send(Frame::disconnect(user_id.clone())).await;
                        break;
                    }
                }
            }
            event = from_data.recv() => {
                match event {
                    Some(RealServerEvent::Data(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(RealServerEvent::Close) | None => break,
                }
            }
        }
    }
}
