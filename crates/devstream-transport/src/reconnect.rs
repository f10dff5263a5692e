//! Reconnecting channel manager.
//!
//! Wraps a `Connector` with exponential-backoff reconnection and
//! idempotent connect/close semantics. Graceful and abnormal
//! disconnections take the same retry path.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::connection::{Connection, Connector, Frame, FrameHandler};

const BACKOFF_FLOOR: Duration = Duration::from_millis(250);
const BACKOFF_CEILING: Duration = Duration::from_millis(10_000);

/// Next reconnect delay: `min(10s, max(250ms, prev * 2))`.
///
/// A successful open resets `prev` to zero, so the first retry after a
/// healthy period waits the floor, not wherever the last outage left off.
#[must_use]
pub fn next_backoff(prev: Duration) -> Duration {
    (prev * 2).clamp(BACKOFF_FLOOR, BACKOFF_CEILING)
}

/// Channel behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Reconnect after any close or error. When false, the channel gives
    /// up after the first terminal event.
    pub auto_reconnect: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
        }
    }
}

enum DriverState {
    Idle {
        outbound_rx: mpsc::UnboundedReceiver<Frame>,
        shutdown_rx: watch::Receiver<bool>,
    },
    Running(tokio::task::JoinHandle<()>),
    Closed,
}

struct Shared {
    connector: Box<dyn Connector>,
    handler: Arc<dyn FrameHandler>,
    options: ChannelOptions,
    connected: AtomicBool,
}

/// A duplex channel that re-establishes itself after disconnection.
///
/// Explicitly constructed and owned; the owning scope is responsible for
/// calling [`close`](Self::close) on teardown.
pub struct ReconnectingChannel {
    shared: Arc<Shared>,
    state: Mutex<DriverState>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReconnectingChannel {
    /// Create a channel over `connector`, delivering inbound frames and
    /// connection transitions to `handler`. No connection is attempted
    /// until [`ensure_connected`](Self::ensure_connected).
    #[must_use]
    pub fn new(
        connector: Box<dyn Connector>,
        handler: Arc<dyn FrameHandler>,
        options: ChannelOptions,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                connector,
                handler,
                options,
                connected: AtomicBool::new(false),
            }),
            state: Mutex::new(DriverState::Idle {
                outbound_rx,
                shutdown_rx,
            }),
            outbound_tx,
            shutdown_tx,
        }
    }

    /// Start connecting if not already connected or scheduled to.
    ///
    /// Idempotent: at most one driver runs regardless of how many times
    /// this is called. The first attempt is immediate. Must be called
    /// from within a tokio runtime. A closed channel stays closed.
    pub fn ensure_connected(&self) {
        let mut state = self.state.lock().unwrap();
        if let DriverState::Idle { .. } = &*state {
            let DriverState::Idle {
                outbound_rx,
                shutdown_rx,
            } = std::mem::replace(&mut *state, DriverState::Closed)
            else {
                unreachable!()
            };
            let handle = tokio::spawn(drive(
                Arc::clone(&self.shared),
                outbound_rx,
                shutdown_rx,
            ));
            *state = DriverState::Running(handle);
        }
    }

    /// Close the channel: cancel any pending reconnect timer and close
    /// any live connection. Safe to call repeatedly or before any
    /// connection exists.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        *state = DriverState::Closed;
        let _ = self.shutdown_tx.send(true);
    }

    /// Send a frame to the coordinator.
    ///
    /// Frames sent while disconnected are dropped with a debug trace;
    /// there is no queue-across-outage semantic.
    pub fn send(&self, frame: Frame) {
        if !self.is_connected() {
            tracing::debug!("dropping outbound frame while disconnected");
            return;
        }
        if self.outbound_tx.send(frame).is_err() {
            tracing::debug!("dropping outbound frame, channel driver gone");
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Duration::ZERO;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        if !backoff.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.changed() => return,
            }
        }

        let attempt = tokio::select! {
            res = shared.connector.connect() => res,
            _ = shutdown_rx.changed() => return,
        };

        match attempt {
            Ok(conn) => {
                backoff = Duration::ZERO;
                shared.connected.store(true, Ordering::SeqCst);
                shared.handler.on_connected(true);

                pump(&shared, conn, &mut outbound_rx, &mut shutdown_rx).await;

                shared.connected.store(false, Ordering::SeqCst);
                shared.handler.on_connected(false);
            }
            Err(e) => {
                tracing::debug!("connect attempt failed: {e}");
            }
        }

        if *shutdown_rx.borrow() || !shared.options.auto_reconnect {
            return;
        }

        backoff = next_backoff(backoff);
    }
}

/// Run one live connection until it terminates, for whatever reason.
async fn pump(
    shared: &Shared,
    mut conn: Box<dyn Connection>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                conn.close().await;
                return;
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    conn.close().await;
                    return;
                };
                if let Err(e) = conn.send(frame).await {
                    tracing::debug!("send failed: {e}");
                    conn.close().await;
                    return;
                }
            }
            inbound = conn.recv() => {
                match inbound {
                    Some(Ok(frame)) => shared.handler.on_frame(frame),
                    Some(Err(e)) => {
                        tracing::debug!("receive failed: {e}");
                        conn.close().await;
                        return;
                    }
                    None => {
                        conn.close().await;
                        return;
                    }
                }
            }
        }
    }
}
