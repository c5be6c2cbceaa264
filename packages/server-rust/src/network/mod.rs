//! Connection tracking, the outbound write path, and shutdown control.

pub mod connection;
pub mod shutdown;

pub use connection::{CodecRegistry, ConnectionHandle, ConnectionId, OutboundMessage};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
