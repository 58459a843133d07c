//! The two server-side registries of spec.md §4.8: `clientKey -> controlChannel`, global, and
//! a per-control-channel `userId -> userChannel` map.
//!
//! Grounded on `jmux-proxy`'s `JmuxCtx` (a `HashMap<LocalChannelId, JmuxChannelCtx>` guarded by a
//! single lock), generalized to two maps and keyed by the wire-visible string ids this protocol
//! uses instead of jmux's allocated integer channel ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rproxy_proto::Frame;
use tokio::sync::mpsc;

/// Events delivered to a user channel's own task, sent by whichever data channel is (or becomes)
/// bound to it.
pub enum UserEvent {
    /// The data channel the client opened in response to our CONNECT is now bound; carries the
    /// sender half of that data channel's outgoing-frame queue so the user channel can wrap its
    /// reads into TRANSFER frames and push them out directly.
    Bind(mpsc::Sender<Frame>),
    /// The bound data channel went away; stop relaying and close.
    Unbind,
    /// Payload arrived from the data channel; write verbatim to the SOCKS5 user socket.
    Data(Bytes),
    /// Close immediately, no further relaying.
    Close,
}

/// Capacity of every bounded channel carrying payload between a user channel and its bound data
/// channel. A slow consumer fills this and stalls the producer's next `send().await`, which is
/// this workspace's realization of spec.md §5's auto-read enable/disable backpressure edge: the
/// producer simply stops polling its own socket for more input while the channel is full.
pub const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct UserChannelHandle {
    pub to_user: mpsc::Sender<UserEvent>,
}

/// Shared state for one authenticated control channel.
pub struct ControlState {
    pub client_key: String,
    pub users: tokio::sync::Mutex<HashMap<String, UserChannelHandle>>,
    /// Outgoing-frame queue for the control socket itself (CONNECT instructions, heartbeat
    /// replies); drained by the control channel's own task.
    pub to_control: mpsc::Sender<Frame>,
}

pub type ControlHandle = Arc<ControlState>;

/// The global `clientKey -> controlChannel` map. A plain `std::sync::Mutex` rather than an async
/// one: every critical section here is a single hash-map operation with no `.await` inside it, so
/// there is nothing to gain from (and a little to lose to) an async mutex, and it lets the SOCKS5
/// password-verification closure — which must be synchronous — consult it directly.
#[derive(Default)]
pub struct Registry {
    controls: Mutex<HashMap<String, ControlHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, client_key: &str) -> bool {
        self.controls.lock().unwrap().contains_key(client_key)
    }

    pub fn get(&self, client_key: &str) -> Option<ControlHandle> {
        self.controls.lock().unwrap().get(client_key).cloned()
    }

    /// Registers `handle` under `client_key` unless one is already registered, matching spec.md
    /// §3's invariant ("the later authenticator is rejected"). The check-then-insert happens
    /// under one lock acquisition, so unlike the source's non-atomic get-then-put this resolves
    /// the race deterministically rather than leaving the winner to chance (see DESIGN.md).
    pub fn try_register(&self, client_key: String, handle: ControlHandle) -> bool {
        let mut controls = self.controls.lock().unwrap();
        if controls.contains_key(&client_key) {
            return false;
        }
        controls.insert(client_key, handle);
        true
    }

    pub fn remove(&self, client_key: &str) -> Option<ControlHandle> {
        self.controls.lock().unwrap().remove(client_key)
    }
}
