//! Transport layer for dev-session streams.
//!
//! Provides:
//! - `Connector` / `Connection` - abstract duplex, message-oriented channel
//! - `ReconnectingChannel` - exponential-backoff reconnection wrapper
//! - `loopback` - in-process channel pair for tests and demos

pub mod connection;
pub mod loopback;
pub mod reconnect;

pub use connection::{ChannelError, Connection, Connector, Frame, FrameHandler};
pub use reconnect::{ChannelOptions, ReconnectingChannel};
