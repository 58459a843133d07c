//! Library surface for the reverse SOCKS5 proxy client. `main.rs` is a thin binary wrapper around
//! these modules; `testsuite` drives them directly the same way `main.rs` does, without going
//! through a subprocess.

pub mod backoff;
pub mod control;
pub mod pool;
pub mod realserver;

/// Capacity of the bounded channels carrying payload between a data channel worker and its
/// bound real-server channel; see `pool.rs` for why this doubles as the backpressure mechanism.
pub const CHANNEL_CAPACITY: usize = 64;
