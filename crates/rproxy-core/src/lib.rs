//! Shared, non-protocol-specific primitives used by both the server and client binaries.

pub mod config;
pub mod idle;
pub mod ids;
pub mod logging;
pub mod shutdown;
