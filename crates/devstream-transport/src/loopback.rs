//! In-process channel pair for tests and demos.
//!
//! `pair()` returns two connected `Connection` ends; `connector()`
//! returns a `Connector` that hands the accept side of each new
//! connection to a coordinator task.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::{ChannelError, Connection, Connector, Frame};

/// One end of an in-process duplex channel.
pub struct LoopbackConnection {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Two connected ends. Frames sent on one are received on the other.
#[must_use]
pub fn pair() -> (LoopbackConnection, LoopbackConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        LoopbackConnection {
            tx: Some(a_tx),
            rx: b_rx,
        },
        LoopbackConnection {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        self.tx
            .as_ref()
            .ok_or(ChannelError::Closed)?
            .send(frame)
            .map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Frame, ChannelError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        // Dropping our sender lets the peer's recv() observe the close.
        self.tx = None;
        self.rx.close();
    }
}

/// Connector side of a loopback setup.
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<LoopbackConnection>,
}

/// Build a connector plus the stream of accepted peer connections.
///
/// Every `connect()` call creates a fresh pair; the far end is delivered
/// on the returned receiver, the way a coordinator would accept a new
/// socket per reconnect.
#[must_use]
pub fn connector() -> (
    LoopbackConnector,
    mpsc::UnboundedReceiver<LoopbackConnection>,
) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (LoopbackConnector { accept_tx }, accept_rx)
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ChannelError> {
        let (client, server) = pair();
        self.accept_tx
            .send(server)
            .map_err(|_| ChannelError::Connect("coordinator is gone".into()))?;
        Ok(Box::new(client))
    }
}
