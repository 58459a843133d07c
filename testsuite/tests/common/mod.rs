//! Shared plumbing for the end-to-end scenarios in `spec.md` §8, grounded on
//! `jetsocat/tests/socks5-to-jmux.rs`'s shape: spawn the real server/client task entry points on
//! loopback ports, drive them with raw sockets standing in for a SOCKS5 user or a private-network
//! target, then assert on what comes back.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use rproxy_core::shutdown::ShutdownHandle;
use rproxy_proto::{Frame, FrameCodec, FrameType};
use rproxy_server::registry::Registry;
use slog::Drain as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const SHARED_SECRET: &str = "correct-horse-battery-staple";

/// Control-channel registration races the test driver that just sent AUTH: poll instead of
/// assuming the server's `try_register` has already run by the time we return from `connect`.
pub async fn wait_until_registered(registry: &Registry, client_key: &str) {
    for _ in 0..100 {
        if registry.contains(client_key) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("client key {client_key} never appeared in the registry");
}

pub fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let async_drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(async_drain, slog::o!())
}

pub struct Server {
    pub control_addr: std::net::SocketAddr,
    pub socks_addr: std::net::SocketAddr,
    pub registry: Arc<Registry>,
    shutdown_handle: ShutdownHandle,
    control_task: JoinHandle<()>,
    socks_task: JoinHandle<()>,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_handle.signal();
        self.control_task.abort();
        self.socks_task.abort();
    }
}

/// Wires up the same two listeners `rproxy-server`'s `main.rs` binds, on ephemeral loopback
/// ports, and spawns their accept loops exactly as the binary does.
pub async fn start_server(password: &str) -> Server {
    start_server_on_listener(TcpListener::bind("127.0.0.1:0").await.unwrap(), password).await
}

/// Like [`start_server`], but binds the control listener to a caller-chosen address instead of an
/// ephemeral one, so a client dialing that exact address eventually reaches it.
pub async fn start_server_with_control_addr(control_addr: std::net::SocketAddr, password: &str) -> Server {
    start_server_on_listener(TcpListener::bind(control_addr).await.unwrap(), password).await
}

async fn start_server_on_listener(control_listener: TcpListener, password: &str) -> Server {
    let logger = test_logger();
    let registry = Arc::new(Registry::new());
    let password: Arc<str> = Arc::from(password);
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let control_addr = control_listener.local_addr().unwrap();

    let socks_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socks_addr = socks_listener.local_addr().unwrap();

    let control_task = {
        let registry = registry.clone();
        let logger = logger.clone();
        let shutdown_signal = shutdown_signal.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = control_listener.accept().await else { return };
                let registry = registry.clone();
                let conn_logger = logger.new(slog::o!("peer" => peer.to_string()));
                tokio::spawn(rproxy_server::control::handle_inbound(stream, registry, conn_logger, shutdown_signal.clone()));
            }
        })
    };

    let socks_task = tokio::spawn(rproxy_server::socks::socks_listener_task(
        socks_listener,
        registry.clone(),
        password,
        logger,
        shutdown_signal,
    ));

    Server { control_addr, socks_addr, registry, shutdown_handle, control_task, socks_task }
}

/// Spawns the real client control-channel task (`rproxy_client::control::run`), which reconnects
/// forever, against `server_addr`. Returns a handle the caller aborts once the scenario is done.
pub fn start_client(server_addr: std::net::SocketAddr, client_key: &str) -> JoinHandle<()> {
    let logger = test_logger();
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let client_key = client_key.to_owned();
    let server_addr = server_addr.to_string();
    // Holding the handle inside the spawned future keeps the watch channel's sender alive for
    // the task's lifetime; these tests only ever tear a client down by aborting this handle.
    tokio::spawn(async move {
        let _shutdown_handle = shutdown_handle;
        rproxy_client::control::run(server_addr, client_key, logger, shutdown_signal).await;
    })
}

/// A minimal stand-in for a real-network target: accepts any number of connections and echoes
/// every byte back on each, until its peer closes.
pub async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    if socket.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// A one-shot stand-in for a bulk-sending real-network target: writes `payload` to the first
/// connection it accepts as fast as the socket allows, then closes its write side. Used to put
/// sustained pressure on the relay chain from the real-server end.
pub async fn spawn_bulk_sender(payload: Vec<u8>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else { return };
        if socket.write_all(&payload).await.is_ok() {
            let _ = socket.shutdown().await;
        }
    });
    addr
}

/// Raw SOCKS5 user handshake (RFC 1928 method negotiation + RFC 1929 password auth + CONNECT),
/// built by hand since this workspace only carries a server-side acceptor, not a client. Returns
/// the connected stream on a `0x00` reply.
pub async fn socks5_connect(
    socks_addr: std::net::SocketAddr,
    client_key: &str,
    password: &str,
    target: std::net::SocketAddr,
) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(socks_addr).await?;

    stream.write_all(&[0x05, 0x01, 0x02]).await?;
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await?;
    assert_eq!(method_reply, [0x05, 0x02], "server must pick USERNAME_PASSWORD");

    let mut auth = vec![0x01, u8::try_from(client_key.len()).unwrap()];
    auth.extend_from_slice(client_key.as_bytes());
    auth.push(u8::try_from(password.len()).unwrap());
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await?;

    let mut auth_reply = [0u8; 2];
    stream.read_exact(&mut auth_reply).await?;
    if auth_reply[1] != 0x00 {
        return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "SOCKS5 auth rejected"));
    }

    let ip = match target.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => panic!("test helper only speaks IPv4 targets"),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "CONNECT rejected"));
    }

    Ok(stream)
}

/// Raw method-negotiation-only probe for the handshake-rejection scenario: offers NO_AUTH only,
/// which this server never accepts.
pub async fn socks5_handshake_rejected_for_bad_method(socks_addr: std::net::SocketAddr) -> [u8; 2] {
    let mut stream = TcpStream::connect(socks_addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// A hand-rolled client control channel speaking the wire protocol directly (no reconnect, no
/// pooling) — used where a scenario needs to observe protocol-level behavior (rejection, closure)
/// that the production client's forever-reconnecting loop would otherwise mask.
pub struct RawControlChannel {
    pub framed: Framed<TcpStream, FrameCodec>,
}

impl RawControlChannel {
    pub async fn connect(control_addr: std::net::SocketAddr, client_key: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(control_addr).await?;
        let mut framed = Framed::new(stream, FrameCodec::control());
        framed.send(Frame::auth(client_key.to_owned())).await.map_err(std::io::Error::other)?;
        Ok(Self { framed })
    }

    /// `None` means the peer closed the socket without replying (the duplicate-key and
    /// bad-prefix rejection paths never write a frame back, they just drop the connection).
    pub async fn try_recv(&mut self) -> Option<Frame> {
        self.framed.next().await.and_then(Result::ok)
    }
}

/// Drives one data channel by hand: dials `control_addr`, sends the CONNECT-ack for `user_id`,
/// then relays everything to/from `real_server` until a DISCONNECT is seen in either direction.
/// Grounded on `rproxy-client`'s `pool::run_worker`/`relay_one_flow`, simplified to a single flow
/// with no pool reuse since these scenarios only ever bind once.
pub async fn run_one_shot_data_channel(
    control_addr: std::net::SocketAddr,
    user_id: String,
    client_key: String,
    mut real_server: TcpStream,
) {
    let stream = TcpStream::connect(control_addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::data());
    framed
        .send(Frame::new(FrameType::Connect, format!("{user_id}@{client_key}"), Bytes::new()))
        .await
        .unwrap();

    let mut real_buf = [0u8; 4096];
    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => match frame.ty {
                        FrameType::Transfer => {
                            if real_server.write_all(&frame.data).await.is_err() {
                                return;
                            }
                        }
                        FrameType::Disconnect => return,
                        FrameType::Heartbeat => {
                            let _ = framed.send(Frame::heartbeat(frame.serial)).await;
                        }
                        _ => return,
                    },
                    _ => return,
                }
            }
            n = real_server.read(&mut real_buf) => {
                match n {
                    Ok(0) => {
                        let _ = framed.send(Frame::disconnect(user_id.clone())).await;
                        return;
                    }
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&real_buf[..n]);
                        if framed.send(Frame::transfer(user_id.clone(), data)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = framed.send(Frame::disconnect(user_id.clone())).await;
                        return;
                    }
                }
            }
        }
    }
}
