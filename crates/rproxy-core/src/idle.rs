//! Per-channel idle detection (spec.md §4.6).
//!
//! A channel's worker owns one [`IdleClock`], touching it on every inbound/outbound frame and
//! racing its deadlines in its own `tokio::select!` loop — there is no background task or poll
//! loop here, matching the "timers are scheduled, not polled" rule of spec.md §5.

use std::time::Duration;
use tokio::time::Instant;

pub const READ_IDLE: Duration = Duration::from_secs(60);
pub const WRITE_IDLE: Duration = Duration::from_secs(40);

/// Tracks last-activity instants for one channel and exposes the deadlines a `select!` loop
/// should race against. `write_idle` is `None` on the server side, which never initiates
/// heartbeats (spec.md §4.6).
pub struct IdleClock {
    last_read: Instant,
    last_write: Instant,
    read_idle: Duration,
    write_idle: Option<Duration>,
}

impl IdleClock {
    pub fn new(read_idle: Duration, write_idle: Option<Duration>) -> Self {
        let now = Instant::now();
        Self { last_read: now, last_write: now, read_idle, write_idle }
    }

    /// Client and server control/data channels: 60s read-idle, client additionally sends an
    /// empty HEARTBEAT after 40s write-idle.
    pub fn client_side() -> Self {
        Self::new(READ_IDLE, Some(WRITE_IDLE))
    }

    /// Server side never initiates heartbeats; it only enforces read-idle.
    pub fn server_side() -> Self {
        Self::new(READ_IDLE, None)
    }

    pub fn touch_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn touch_write(&mut self) {
        self.last_write = Instant::now();
    }

    /// When reached with no intervening `touch_read`, the channel must be closed.
    pub fn read_deadline(&self) -> Instant {
        self.last_read + self.read_idle
    }

    /// When reached with no intervening `touch_write`, an empty HEARTBEAT must be sent. Only
    /// meaningful when constructed via [`IdleClock::client_side`]; returns a deadline far in the
    /// future otherwise so a `select!` arm racing it never fires.
    pub fn write_deadline(&self) -> Instant {
        match self.write_idle {
            Some(idle) => self.last_write + idle,
            None => self.last_write + Duration::from_secs(u64::MAX / 2),
        }
    }
}
