//! Abstract duplex channel to a session coordinator.
//!
//! The core never implements a concrete wire transport; it depends on
//! these capabilities only: connect, send, receive, closed.

use async_trait::async_trait;
use bytes::Bytes;

/// One message frame on the wire.
///
/// Text frames carry JSON envelopes (stack/task/control messages);
/// binary frames carry raw output bytes or newline-delimited trace
/// events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Text frame from anything string-like.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Binary frame from raw bytes.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }
}

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("channel closed")]
    Closed,
}

/// Factory for connections to one logical stream endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, ChannelError>;
}

/// A live duplex connection.
#[async_trait]
pub trait Connection: Send {
    /// Send one frame to the peer.
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError>;

    /// Next inbound frame. `None` once the peer has closed; an error is
    /// terminal for this connection. Must be cancel-safe: the channel
    /// driver polls it inside a `select!`.
    async fn recv(&mut self) -> Option<Result<Frame, ChannelError>>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Consumer of inbound frames and connection-state transitions.
///
/// Frames are delivered from a single driver task, strictly in arrival
/// order; implementations may mutate their state without further
/// synchronization against other deliveries. Implementations must not
/// panic from `on_connected`.
pub trait FrameHandler: Send + Sync {
    /// One inbound frame, in arrival order.
    fn on_frame(&self, frame: Frame);

    /// Connection established or lost. No continuity is guaranteed
    /// across a reconnect; the coordinator resends a full snapshot.
    fn on_connected(&self, connected: bool) {
        let _ = connected;
    }
}
