//! The bounded data-channel pool (spec.md §4.5) and the persistent worker task each pooled
//! connection runs.
//!
//! A data channel is a single long-lived TCP connection to the server that is rebound to a
//! different `userId` every time it is borrowed: binding sends a fresh CONNECT-ack frame over
//! the *same* socket, and returning it to the pool leaves the socket open, waiting for the next
//! bind. This is why `Pool` holds command senders into running worker tasks rather than idle
//! `Framed` values — "re-enable reads, clear bindings, enqueue" (§4.5) is exactly what a worker
//! does by looping back to await its next [`WorkerCommand::Bind`] instead of exiting.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use rproxy_core::idle::IdleClock;
use rproxy_core::shutdown::ShutdownSignal;
use rproxy_proto::{Frame, FrameCodec, FrameType};
use slog::Logger;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use crate::realserver::RealServerEvent;

/// Pool capacity: spec.md §4.5, "bounded at 100 idle data channels".
const POOL_CAPACITY: usize = 100;

pub struct BindRequest {
    pub user_id: String,
    pub client_key: String,
    pub to_realserver: mpsc::Sender<RealServerEvent>,
    pub from_realserver: mpsc::Receiver<Frame>,
}

enum WorkerCommand {
    Bind(BindRequest),
    Close,
}

pub struct Pool {
    server_addr: String,
    idle: Mutex<VecDeque<mpsc::Sender<WorkerCommand>>>,
    logger: Logger,
    shutdown: ShutdownSignal,
}

impl Pool {
    pub fn new(server_addr: String, logger: Logger, shutdown: ShutdownSignal) -> Arc<Self> {
        Arc::new(Self { server_addr, idle: Mutex::new(VecDeque::new()), logger, shutdown })
    }

    /// A fresh clone of this pool's shutdown signal, handed to tasks bound through it so they can
    /// also wait on it directly (e.g. the real-server channel on the other side of a bind).
    pub fn shutdown(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Hands `request` to an idle pooled connection, or dials a fresh one if the pool is empty.
    pub async fn borrow(self: &Arc<Self>, request: BindRequest) -> io::Result<()> {
        loop {
            let idle_tx = { self.idle.lock().await.pop_front() };
            let Some(idle_tx) = idle_tx else { break };

            match idle_tx.send(WorkerCommand::Bind(request)).await {
                Ok(()) => return Ok(()),
                // The worker's receiver dropped between being enqueued and now (its socket died
                // while idle); try the next idle entry instead of failing the whole borrow.
                Err(mpsc::error::SendError(WorkerCommand::Bind(returned))) => {
                    return self.dial_and_bind(returned).await;
                }
                Err(_) => unreachable!("we only ever send WorkerCommand::Bind here"),
            }
        }

        self.dial_and_bind(request).await
    }

    async fn dial_and_bind(self: &Arc<Self>, request: BindRequest) -> io::Result<()> {
        let stream = TcpStream::connect(&self.server_addr).await?;
        let framed = Framed::new(stream, FrameCodec::data());
        let pool = self.clone();
        let logger = self.logger.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(run_worker(framed, pool, request, logger, shutdown));
        Ok(())
    }

    /// Returns `false` (caller must drop the connection) once the pool is already at capacity.
    async fn try_enqueue_idle(&self, cmd_tx: mpsc::Sender<WorkerCommand>) -> bool {
        let mut idle = self.idle.lock().await;
        if idle.len() >= POOL_CAPACITY {
            return false;
        }
        idle.push_back(cmd_tx);
        true
    }
}

/// Runs one pooled TCP connection for its entire lifetime: bind to a flow, relay until that flow
/// ends cleanly, go idle and wait to be rebound, repeat. Exits (closing the socket) on any
/// transport error, idle timeout, or once the pool is full and has nowhere to park it.
async fn run_worker(mut framed: Framed<TcpStream, FrameCodec>, pool: Arc<Pool>, first: BindRequest, logger: Logger, mut shutdown: ShutdownSignal) {
    let mut pending = Some(first);

    loop {
        let BindRequest { user_id, client_key, to_realserver, mut from_realserver } = match pending.take() {
            Some(request) => request,
            None => {
                let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
                if !pool.try_enqueue_idle(cmd_tx).await {
                    slog::debug!(logger, "pool at capacity, closing idle data channel");
                    break;
                }
                tokio::select! {
                    _ = shutdown.wait() => {
                        slog::info!(logger, "idle data channel closing for shutdown");
                        break;
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(WorkerCommand::Bind(request)) => request,
                        Some(WorkerCommand::Close) | None => break,
                    }
                }
            }
        };

        let logger = logger.new(slog::o!("user_id" => user_id.clone()));

        if framed
            .send(Frame::new(FrameType::Connect, format!("{user_id}@{client_key}"), Bytes::new()))
            .await
            .is_err()
        {
            break;
        }

        let clean = relay_one_flow(&mut framed, &user_id, &to_realserver, &mut from_realserver, &logger, shutdown.clone()).await;
        if !clean {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_queue_rejects_past_capacity() {
        let (_handle, shutdown) = rproxy_core::shutdown::ShutdownHandle::new();
        let pool = Pool::new("127.0.0.1:0".to_owned(), slog::Logger::root(slog::Discard, slog::o!()), shutdown);

        for _ in 0..POOL_CAPACITY {
            let (cmd_tx, _cmd_rx) = mpsc::channel(1);
            assert!(pool.try_enqueue_idle(cmd_tx).await);
        }

        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        assert!(!pool.try_enqueue_idle(cmd_tx).await);
    }
}

/// Relays one bound flow until DISCONNECT is seen in either direction. Returns whether the
/// underlying connection is still healthy enough to be returned to the pool.
async fn relay_one_flow(
    framed: &mut Framed<TcpStream, FrameCodec>,
    user_id: &str,
    to_realserver: &mpsc::Sender<RealServerEvent>,
    from_realserver: &mut mpsc::Receiver<Frame>,
    logger: &Logger,
    mut shutdown: ShutdownSignal,
) -> bool {
    let mut idle = IdleClock::client_side();

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                slog::info!(logger, "data channel closing for shutdown");
                return false;
            }
            _ = tokio::time::sleep_until(idle.read_deadline()) => {
                slog::warn!(logger, "data channel read-idle timeout");
                return false;
            }
            _ = tokio::time::sleep_until(idle.write_deadline()) => {
                if framed.send(Frame::heartbeat(0)).await.is_err() {
                    return false;
                }
                idle.touch_write();
            }
            maybe_frame = framed.next() => {
                match maybe_frame {
                    Some(Ok(frame)) => {
                        idle.touch_read();
                        match frame.ty {
                            FrameType::Transfer => {
                                if to_realserver.send(RealServerEvent::Data(frame.data)).await.is_err() {
                                    return false;
                                }
                            }
                            FrameType::Disconnect => {
                                let _ = to_realserver.send(RealServerEvent::Close).await;
                                return true;
                            }
                            // Always the server's echo of a heartbeat we just sent on
                            // write-idle above; this client never replies to one.
                            FrameType::Heartbeat => {}
                            other => {
                                slog::warn!(logger, "unexpected frame type on data channel, closing"; "type" => ?other);
                                return false;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        slog::debug!(logger, "data channel decode error"; "error" => %err);
                        return false;
                    }
                    None => return false,
                }
            }
            outgoing = from_realserver.recv() => {
                match outgoing {
                    Some(frame) => {
                        let is_disconnect = frame.ty == FrameType::Disconnect;
                        idle.touch_write();
                        if framed.send(frame).await.is_err() {
                            return false;
                        }
                        if is_disconnect {
                            return true;
                        }
                    }
                    None => return false,
                }
            }
        }
    }
}
