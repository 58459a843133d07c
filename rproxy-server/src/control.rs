//! The server's client-facing listener: accepts every control *and* data channel on one port,
//! classifying each freshly accepted socket by the type of its first frame (spec.md §4.3).
//!
//! Grounded on `jmux-proxy/src/lib.rs`'s `scheduler_task_impl` for the `tokio::select!` shape of
//! a per-channel event loop (read a frame on one arm, drain an outgoing-frame queue on another,
//! race an idle deadline on a third, never `.await` anywhere else in the loop body).

use std::sync::Arc;

use futures_util::{SinkExt as _, StreamExt as _};
use rproxy_core::idle::IdleClock;
use rproxy_core::shutdown::ShutdownSignal;
use rproxy_proto::{Frame, FrameCodec, FrameType, MAX_DATA_FRAME_SIZE};
use slog::Logger;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::registry::{ControlHandle, ControlState, Registry, UserChannelHandle, UserEvent, CHANNEL_CAPACITY};

const CLIENT_KEY_PREFIX: &str = "ZC-";

/// Entry point for every accepted client-facing connection. Reads exactly one frame to decide
/// whether the socket just became a control channel (`AUTH`) or a data channel (`CONNECT`-ack);
/// anything else is a protocol violation and the socket is dropped. `shutdown` is held for the
/// life of the connection so the process can wait for every such task to finish on shutdown.
pub async fn handle_inbound(stream: TcpStream, registry: Arc<Registry>, logger: Logger, shutdown: ShutdownSignal) {
    let mut framed = Framed::new(stream, FrameCodec::control());

    let first = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => {
            slog::warn!(logger, "dropping client connection: decode error on first frame"; "error" => %err);
            return;
        }
        None => return,
    };

    match first.ty {
        FrameType::Auth => run_control_channel(framed, first.uri, registry, logger, shutdown).await,
        FrameType::Connect => {
            framed.codec_mut().set_max_frame_size(MAX_DATA_FRAME_SIZE);
            run_data_channel(framed, first.uri, registry, logger, shutdown).await;
        }
        other => {
            slog::warn!(logger, "dropping client connection: unexpected first frame"; "type" => ?other);
        }
    }
}

async fn run_control_channel(
    mut framed: Framed<TcpStream, FrameCodec>,
    client_key: String,
    registry: Arc<Registry>,
    logger: Logger,
    mut shutdown: ShutdownSignal,
) {
    if !client_key.starts_with(CLIENT_KEY_PREFIX) {
        slog::warn!(logger, "rejecting AUTH: client key missing required prefix"; "client_key" => %client_key);
        return;
    }

    let (to_control_tx, mut to_control_rx) = tokio::sync::mpsc::channel::<Frame>(CHANNEL_CAPACITY);
    let state: ControlHandle = Arc::new(ControlState {
        client_key: client_key.clone(),
        users: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        to_control: to_control_tx,
    });

    if !registry.try_register(client_key.clone(), state.clone()) {
        slog::warn!(logger, "rejecting AUTH: client key already has a control channel"; "client_key" => %client_key);
        return;
    }

    let logger = logger.new(slog::o!("client_key" => client_key.clone()));
    slog::info!(logger, "control channel authenticated");

    let mut idle = IdleClock::server_side();

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "control channel closing for shutdown");
                break;
            }
            _ = tokio::time::sleep_until(idle.read_deadline()) => {
                slog::warn!(logger, "control channel read-idle timeout");
                break;
            }
            maybe_frame = framed.next() => {
                match maybe_frame {
                    Some(Ok(frame)) => {
                        idle.touch_read();
                        if !dispatch_control_frame(&mut framed, &state, frame, &logger).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        slog::warn!(logger, "control channel decode error"; "error" => %err);
                        break;
                    }
                    None => {
                        slog::info!(logger, "control channel closed by peer");
                        break;
                    }
                }
            }
            outgoing = to_control_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if framed.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    registry.remove(&state.client_key);
    let mut users = state.users.lock().await;
    for (_, user) in users.drain() {
        let _ = user.to_user.send(UserEvent::Close).await;
    }
    slog::info!(logger, "control channel closed; user channels torn down"; "count" => users.len());
}

/// Returns `false` when the control channel must be closed.
async fn dispatch_control_frame(
    framed: &mut Framed<TcpStream, FrameCodec>,
    state: &ControlHandle,
    frame: Frame,
    logger: &Logger,
) -> bool {
    match frame.ty {
        FrameType::Heartbeat => framed.send(Frame::heartbeat(frame.serial)).await.is_ok(),
        FrameType::Disconnect => {
            let user_id = frame.uri;
            let mut users = state.users.lock().await;
            if let Some(user) = users.remove(&user_id) {
                let _ = user.to_user.send(UserEvent::Close).await;
            }
            true
        }
        other => {
            slog::warn!(logger, "unexpected frame type on control channel, closing"; "type" => ?other);
            false
        }
    }
}

/// A data channel is a single long-lived client→server TCP connection that the client's pool
/// (spec.md §4.5) rebinds to a different `userId` every time it is reused: a bind is a fresh
/// CONNECT-ack frame sent over the *same* socket, not a new connection. The server side mirrors
/// that: after one bound flow ends cleanly it waits for the next CONNECT-ack on this socket
/// rather than closing it, so `first_uri` seeds the first iteration and the loop re-enters
/// `framed.next()` for every rebind after that.
async fn run_data_channel(
    mut framed: Framed<TcpStream, FrameCodec>,
    first_uri: String,
    registry: Arc<Registry>,
    logger: Logger,
    shutdown: ShutdownSignal,
) {
    let mut next_uri = Some(first_uri);

    loop {
        let uri = match next_uri.take() {
            Some(uri) => uri,
            None => match framed.next().await {
                Some(Ok(frame)) if frame.ty == FrameType::Connect => frame.uri,
                Some(Ok(other)) => {
                    slog::warn!(logger, "expected a CONNECT-ack on idle data channel, closing"; "type" => ?other.ty);
                    return;
                }
                Some(Err(err)) => {
                    slog::debug!(logger, "idle data channel decode error"; "error" => %err);
                    return;
                }
                None => return,
            },
        };

        if !bind_and_relay(&mut framed, uri, &registry, &logger, shutdown.clone()).await {
            return;
        }
    }
}

/// Binds one CONNECT-ack to its user channel and relays until that flow ends. Returns whether the
/// socket is still healthy and should be offered another rebind.
async fn bind_and_relay(
    framed: &mut Framed<TcpStream, FrameCodec>,
    uri: String,
    registry: &Arc<Registry>,
    logger: &Logger,
    mut shutdown: ShutdownSignal,
) -> bool {
    let Some((user_id, client_key)) = uri.split_once('@') else {
        slog::warn!(logger, "malformed data-channel CONNECT-ack uri"; "uri" => %uri);
        return false;
    };
    let user_id = user_id.to_owned();

    let Some(control) = registry.get(client_key) else {
        slog::warn!(logger, "data channel for unknown client key"; "client_key" => %client_key);
        return false;
    };

    let user_handle = {
        let users = control.users.lock().await;
        users.get(&user_id).cloned()
    };
    let Some(user_handle) = user_handle else {
        slog::warn!(logger, "data channel for unknown user id"; "user_id" => %user_id);
        return false;
    };

    let (to_data_tx, mut to_data_rx) = tokio::sync::mpsc::channel::<Frame>(CHANNEL_CAPACITY);
    if user_handle.to_user.send(UserEvent::Bind(to_data_tx)).await.is_err() {
        return false;
    }

    let logger = logger.new(slog::o!("user_id" => user_id.clone(), "client_key" => client_key.to_owned()));
    slog::info!(logger, "data channel bound");

    let mut idle = IdleClock::server_side();
    let mut clean = false;

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "data channel closing for shutdown");
                break;
            }
            _ = tokio::time::sleep_until(idle.read_deadline()) => {
                slog::warn!(logger, "data channel read-idle timeout");
                break;
            }
            maybe_frame = framed.next() => {
                match maybe_frame {
                    Some(Ok(frame)) => {
                        idle.touch_read();
                        match frame.ty {
                            FrameType::Transfer => {
                                if user_handle.to_user.send(UserEvent::Data(frame.data)).await.is_err() {
                                    break;
                                }
                            }
                            FrameType::Heartbeat => {
                                if framed.send(Frame::heartbeat(frame.serial)).await.is_err() {
                                    break;
                                }
                            }
                            FrameType::Disconnect => {
                                let mut users = control.users.lock().await;
                                if users.remove(&user_id).is_some() {
                                    let _ = user_handle.to_user.send(UserEvent::Close).await;
                                }
                                clean = true;
                                break;
                            }
                            other => {
                                slog::warn!(logger, "unexpected frame type on data channel, closing"; "type" => ?other);
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        slog::warn!(logger, "data channel decode error"; "error" => %err);
                        break;
                    }
                    None => break,
                }
            }
            outgoing = to_data_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let is_disconnect = frame.ty == FrameType::Disconnect;
                        if framed.send(frame).await.is_err() {
                            break;
                        }
                        if is_disconnect {
                            clean = true;
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Local disconnect of a data channel has the same effect as an inbound DISCONNECT for its
    // userId (spec.md §4.3): make sure the user channel is unbound even if we broke out above
    // without an explicit DISCONNECT frame (peer reset, idle timeout, decode error, ...).
    let mut users = control.users.lock().await;
    if users.remove(&user_id).is_some() {
        let _ = user_handle.to_user.send(UserEvent::Unbind).await;
    }

    clean
}

/// Helper used by `socks.rs` to build the [`UserChannelHandle`] without depending on the private
/// event type directly.
pub fn user_channel_handle(capacity: usize) -> (UserChannelHandle, tokio::sync::mpsc::Receiver<UserEvent>) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (UserChannelHandle { to_user: tx }, rx)
}
